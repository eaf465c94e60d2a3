use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::cache::GraphCache;
use crate::component::Component;
use crate::core::TaskId;
use crate::data::DataCollection;
use crate::debug::DebugDisplay;
use crate::element::Resume;
use crate::executor::ExecutorHandle;
use crate::graph::Node;
use crate::settings::Settings;

/// Clears the pause flag of a task from anywhere, typically from a generic
/// task scheduled to run once whatever the paused task waits on is done.
#[derive(Clone, Debug)]
pub struct Wakeup(Arc<AtomicBool>);

impl Wakeup {
    pub fn wake(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Mutable state of one task execution.
///
/// A context is created when a task becomes active and lives until the task
/// completes. It is owned by that execution alone; when the element asks to
/// be re-invoked, the same context comes back on the next attempt, together
/// with whatever it stored through [`Context::set_state`].
pub struct Context {
    pub input_data: DataCollection,
    pub output_data: DataCollection,
    pub(crate) task_id: TaskId,
    pub(crate) node: Option<Arc<Node>>,
    pub(crate) component: Option<Arc<dyn Component>>,
    pub(crate) cache: Option<Arc<GraphCache>>,
    pub(crate) executor: Option<ExecutorHandle>,
    pub(crate) debug: Option<Arc<dyn DebugDisplay>>,
    pub(crate) elapsed: Duration,
    pub(crate) execution_count: u32,
    pub(crate) cache_hit: bool,
    /// Pipeline progress of an element that asked to be invoked again.
    pub(crate) resume: Option<Resume>,
    paused: Arc<AtomicBool>,
    state: Option<Box<dyn Any + Send>>,
    span: tracing::Span,
}

impl Context {
    pub fn new(input_data: DataCollection) -> Self {
        Self {
            input_data,
            output_data: DataCollection::default(),
            task_id: TaskId::INVALID,
            node: None,
            component: None,
            cache: None,
            executor: None,
            debug: None,
            elapsed: Duration::ZERO,
            execution_count: 0,
            cache_hit: false,
            resume: None,
            paused: Arc::new(AtomicBool::new(false)),
            state: None,
            span: tracing::Span::none(),
        }
    }

    pub fn with_node(mut self, node: Arc<Node>) -> Self {
        self.node = Some(node);
        self
    }

    pub fn with_component(mut self, component: Arc<dyn Component>) -> Self {
        self.component = Some(component);
        self
    }

    pub fn with_cache(mut self, cache: Arc<GraphCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub(crate) fn with_task(mut self, task_id: TaskId, span: tracing::Span) -> Self {
        self.task_id = task_id;
        self.span = span;
        self
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn node(&self) -> Option<&Arc<Node>> {
        self.node.as_ref()
    }

    /// Settings in effect: an override carried by the input, else the node's
    /// default settings.
    pub fn settings(&self) -> Option<Arc<Settings>> {
        let default = self.node.as_ref().map(|node| node.settings());
        self.input_data.settings(default.as_ref())
    }

    pub fn component(&self) -> Option<&Arc<dyn Component>> {
        self.component.as_ref()
    }

    pub fn cache(&self) -> Option<&Arc<GraphCache>> {
        self.cache.as_ref()
    }

    /// Scheduling surface of the executor running this task, for elements
    /// that expand into more work at run time.
    pub fn executor(&self) -> Option<&ExecutorHandle> {
        self.executor.as_ref()
    }

    pub fn task_name(&self) -> String {
        match &self.node {
            Some(node) => node.name().to_string(),
            None => format!("task {}", self.task_id),
        }
    }

    pub fn component_name(&self) -> String {
        self.component
            .as_ref()
            .map(|component| component.name().to_string())
            .unwrap_or_else(|| String::from("<none>"))
    }

    /// Time spent inside the element's own logic, over all invocations.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn execution_count(&self) -> u32 {
        self.execution_count
    }

    pub fn was_cache_hit(&self) -> bool {
        self.cache_hit
    }

    /// Parks the task: the executor skips it until the returned handle wakes
    /// it up. The element should return `false` right after pausing.
    pub fn pause(&mut self) -> Wakeup {
        self.paused.store(true, Ordering::Release);
        Wakeup(self.paused.clone())
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Stores the resumable state of a cooperative element, replacing any
    /// previous one. Survives re-invocations of the same task.
    pub fn set_state<T: Any + Send>(&mut self, state: T) {
        self.state = Some(Box::new(state));
    }

    pub fn state<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.state.as_mut()?.downcast_mut::<T>()
    }

    pub fn take_state<T: Any + Send>(&mut self) -> Option<T> {
        match self.state.take()?.downcast::<T>() {
            Ok(state) => Some(*state),
            Err(other) => {
                self.state = Some(other);
                None
            }
        }
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Progress {
        step: u32,
    }

    #[test]
    fn test_state_survives_between_calls() {
        let mut ctx = Context::new(DataCollection::default());
        assert!(ctx.state::<Progress>().is_none());

        ctx.set_state(Progress { step: 0 });
        for _ in 0..2 {
            if let Some(progress) = ctx.state::<Progress>() {
                progress.step += 1;
            }
        }

        assert_eq!(ctx.state::<Progress>(), Some(&mut Progress { step: 2 }));
        assert_eq!(ctx.take_state::<Progress>(), Some(Progress { step: 2 }));
        assert!(ctx.state::<Progress>().is_none());
    }

    #[test]
    fn test_take_state_wrong_type_keeps_state() {
        let mut ctx = Context::new(DataCollection::default());
        ctx.set_state(5u8);
        assert!(ctx.take_state::<u32>().is_none());
        assert_eq!(ctx.state::<u8>(), Some(&mut 5));

        ctx.set_state(Progress { step: 1 });
        assert!(ctx.state::<u8>().is_none());
    }

    #[test]
    fn test_pause_and_wake() {
        let mut ctx = Context::new(DataCollection::default());
        assert!(!ctx.is_paused());
        let wakeup = ctx.pause();
        assert!(ctx.is_paused());
        wakeup.wake();
        assert!(!ctx.is_paused());
    }

    #[test]
    fn test_settings_fall_back_to_none() {
        let ctx = Context::new(DataCollection::default());
        assert!(ctx.settings().is_none());
        assert_eq!(ctx.task_name(), "task #invalid");
        assert_eq!(ctx.component_name(), "<none>");
    }
}
