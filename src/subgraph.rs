use std::sync::Arc;

use crate::context::Context;
use crate::core::TaskId;
use crate::data::DataCollection;
use crate::element::{Element, InputForwardingElement};
use crate::settings::Settings;

/// Runs the graph named by the node's subgraph reference.
///
/// Static references never reach this element, the compiler inlines them.
/// Dynamic ones are scheduled on the first invocation, with the task input
/// forwarded into the nested input node; the task then pauses until a generic
/// task depending on the nested terminal wakes it up, and completes with the
/// nested output.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubgraphElement;

/// Progress of a scheduled nested graph.
struct Nested {
    terminal: TaskId,
    wakeup: TaskId,
}

impl Element for SubgraphElement {
    fn execute_internal(&self, ctx: &mut Context) -> anyhow::Result<bool> {
        if let Some(nested) = ctx.take_state::<Nested>() {
            let Some(executor) = ctx.executor().cloned() else {
                ctx.output_data = DataCollection::cancelled();
                return Ok(true);
            };

            ctx.output_data = executor
                .output_data(nested.terminal)
                .unwrap_or_else(DataCollection::cancelled);

            executor.release(nested.terminal);
            executor.release(nested.wakeup);
            return Ok(true);
        }

        let graph = ctx
            .settings()
            .and_then(|settings| settings.subgraph.as_ref().map(|sub| sub.graph.clone()));

        let (Some(executor), Some(graph)) = (ctx.executor().cloned(), graph) else {
            tracing::debug!(task = %ctx.task_id(), "nothing to run, cancelling");
            ctx.output_data = DataCollection::cancelled();
            return Ok(true);
        };

        let input = Arc::new(InputForwardingElement::new(ctx.input_data.clone()));
        let terminal = executor.schedule_graph(&graph, ctx.component().cloned(), input, &[])?;

        let resume = ctx.pause();
        let wakeup = executor.schedule_generic(
            move || {
                resume.wake();
                true
            },
            &[terminal],
        );

        tracing::debug!(
            task = %ctx.task_id(),
            graph = graph.name(),
            %terminal,
            "scheduled nested graph"
        );

        ctx.set_state(Nested { terminal, wakeup });
        Ok(false)
    }

    fn is_cacheable(&self, _: Option<&Settings>) -> bool {
        false
    }

    fn name(&self) -> &str {
        "Subgraph"
    }
}
