use crate::context::Context;
use crate::settings::Settings;

/// Receives the finished context of every node running in `Debug` or
/// `Isolated` mode.
pub trait DebugDisplay: Send + Sync {
    fn display(&self, ctx: &Context, settings: &Settings);
}

/// Reports the node output as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDebugDisplay;

impl DebugDisplay for LogDebugDisplay {
    fn display(&self, ctx: &Context, settings: &Settings) {
        let label = settings
            .debug
            .label
            .clone()
            .unwrap_or_else(|| ctx.task_name());

        tracing::info!(
            task = %ctx.task_id(),
            component = %ctx.component_name(),
            mode = ?settings.execution_mode,
            items = ctx.output_data.len(),
            elapsed = ?ctx.elapsed(),
            "debug output of '{label}'"
        );

        for (index, item) in ctx
            .output_data
            .iter()
            .take(settings.debug.max_items_logged)
            .enumerate()
        {
            tracing::info!(
                index,
                usage = ?item.usage,
                tags = ?item.tags,
                kind = item.data.type_name(),
                "{:?}",
                item.data
            );
        }
    }
}
