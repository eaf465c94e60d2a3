use std::sync::Arc;

use crate::component::Component;
use crate::context::Context;
use crate::core::TaskId;
use crate::element::{Element, TrivialElement};
use crate::graph::Node;

/// Lifecycle of a task inside one executor.
///
/// `Pending -> Ready -> Active -> Completed`, or `Failed` when the element
/// returns an error or panics. A failed task never stores an output, so its
/// dependents stay `Pending`; [`Executor::audit`](super::Executor::audit)
/// reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Ready,
    Active,
    Completed,
    Failed,
}

pub(crate) struct ScheduledTask {
    pub id: TaskId,
    pub label: String,
    pub node: Option<Arc<Node>>,
    pub element: Option<Arc<dyn Element>>,
    pub component: Option<Arc<dyn Component>>,
    /// Data dependencies; their outputs are concatenated into the input.
    pub inputs: Vec<TaskId>,
    /// Ordering-only dependencies.
    pub after: Vec<TaskId>,
}

impl ScheduledTask {
    pub fn dependencies(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.inputs.iter().chain(&self.after).copied()
    }

    /// Element to run, resolved when the task activates so that settings
    /// edited after compilation still apply.
    pub fn element(&self) -> Arc<dyn Element> {
        match (&self.element, &self.node) {
            (Some(element), _) => element.clone(),
            (None, Some(node)) => node.settings().element.clone(),
            (None, None) => Arc::new(TrivialElement),
        }
    }
}

/// Element and context of an active task. Moved to a worker while the task
/// runs there, and back once it returns.
pub(crate) struct Run {
    pub element: Arc<dyn Element>,
    pub context: Context,
}

impl Run {
    /// Invokes the element once. Panics are turned into task errors.
    pub fn invoke(&mut self) -> anyhow::Result<bool> {
        let span = self.context.span().clone();
        let _enter = span.enter();

        let element = &self.element;
        let context = &mut self.context;

        // A panicking element only ever held its own context, which is
        // discarded with the failed task.
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| element.execute(context))) {
            Ok(result) => result,
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("Task panicked: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("Task panicked: {s}")
                } else {
                    String::from("Task panicked with unknown payload")
                };

                Err(anyhow::anyhow!(msg))
            }
        }
    }
}

pub(crate) struct Entry {
    pub task: ScheduledTask,
    pub state: TaskState,
    /// Dependencies not completed yet.
    pub waiting: usize,
    /// `Some` while active and idle on the driver, `None` otherwise.
    pub run: Option<Run>,
}

impl Entry {
    pub fn is_runnable(&self) -> bool {
        self.run
            .as_ref()
            .is_some_and(|run| !run.context.is_paused())
    }

    pub fn is_paused(&self) -> bool {
        self.run
            .as_ref()
            .is_some_and(|run| run.context.is_paused())
    }
}

/// What a worker sends back after invoking a task.
pub(crate) struct Finished {
    pub id: TaskId,
    pub run: Run,
    pub result: anyhow::Result<bool>,
}
