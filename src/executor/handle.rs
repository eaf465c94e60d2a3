use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::cache::GraphCache;
use crate::compiler::GraphCompiler;
use crate::component::Component;
use crate::config::OutputRetention;
use crate::core::TaskId;
use crate::data::DataCollection;
use crate::element::{Element, FetchInputElement, GenericElement};
use crate::error::ExecutorError;
use crate::executor::task::ScheduledTask;
use crate::graph::{Graph, GraphId};

/// Batches scheduled since the last tick, and the id counter.
#[derive(Default)]
pub(crate) struct Inbox {
    pub next_id: u64,
    pub batches: Vec<Vec<ScheduledTask>>,
}

impl Inbox {
    pub fn len(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    fn reserve(&mut self, count: usize) -> u64 {
        let base = self.next_id;
        self.next_id += count as u64;
        base
    }
}

/// Stored task outputs. Written by the driver only, read from anywhere.
#[derive(Default)]
pub(crate) struct OutputStore {
    data: HashMap<TaskId, DataCollection>,
    /// Scheduled tasks that still have to read an output.
    readers: HashMap<TaskId, usize>,
    /// Outputs handed to callers, kept until released.
    pinned: HashSet<TaskId>,
    /// Released ids the driver has not forgotten yet.
    released: Vec<TaskId>,
}

impl OutputStore {
    pub fn get(&self, id: TaskId) -> Option<DataCollection> {
        self.data.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn add_reader(&mut self, id: TaskId) {
        *self.readers.entry(id).or_default() += 1;
    }

    pub fn pin(&mut self, id: TaskId) {
        self.pinned.insert(id);
    }

    pub fn is_pinned(&self, id: TaskId) -> bool {
        self.pinned.contains(&id)
    }

    pub fn store(&mut self, id: TaskId, output: DataCollection, retention: OutputRetention) {
        self.data.insert(id, output);
        self.evict_if_unused(id, retention);
    }

    /// Output read on behalf of one reader, who stops counting towards its
    /// retention.
    pub fn consume(&mut self, id: TaskId, retention: OutputRetention) -> Option<DataCollection> {
        let output = self.get(id);
        self.forget_reader(id, retention);
        output
    }

    pub fn forget_reader(&mut self, id: TaskId, retention: OutputRetention) {
        if let Some(count) = self.readers.get_mut(&id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.readers.remove(&id);
            }
        }

        self.evict_if_unused(id, retention);
    }

    pub fn release(&mut self, id: TaskId, retention: OutputRetention) {
        if self.pinned.remove(&id) {
            self.evict_if_unused(id, retention);
            if retention == OutputRetention::ReleaseConsumed {
                self.released.push(id);
            }
        }
    }

    pub fn take_released(&mut self) -> Vec<TaskId> {
        std::mem::take(&mut self.released)
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.readers.clear();
        self.pinned.clear();
        self.released.clear();
    }

    fn evict_if_unused(&mut self, id: TaskId, retention: OutputRetention) {
        if retention == OutputRetention::ReleaseConsumed
            && !self.readers.contains_key(&id)
            && !self.pinned.contains(&id)
            && self.data.remove(&id).is_some()
        {
            tracing::trace!(task = %id, "released output");
        }
    }
}

pub(crate) struct Shared {
    pub inbox: Mutex<Inbox>,
    pub outputs: RwLock<OutputStore>,
    pub compiler: GraphCompiler,
    pub cache: Arc<GraphCache>,
    pub retention: OutputRetention,
}

impl Shared {
    pub fn new(retention: OutputRetention) -> Self {
        Self {
            inbox: Mutex::default(),
            outputs: RwLock::default(),
            compiler: GraphCompiler::new(),
            cache: Arc::new(GraphCache::new()),
            retention,
        }
    }

    pub fn inbox(&self) -> MutexGuard<'_, Inbox> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn outputs(&self) -> RwLockReadGuard<'_, OutputStore> {
        self.outputs.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn outputs_mut(&self) -> RwLockWriteGuard<'_, OutputStore> {
        self.outputs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scheduling surface of an [`Executor`](super::Executor).
///
/// Cheap to clone and usable from any thread, including from inside running
/// elements. Scheduled work is picked up on the executor's next tick.
#[derive(Clone)]
pub struct ExecutorHandle {
    pub(crate) shared: Arc<Shared>,
}

impl ExecutorHandle {
    /// Schedules the graph of `component`, fed by the component's own data.
    /// Returns the id of the task holding the graph output.
    pub fn schedule(
        &self,
        component: Arc<dyn Component>,
        dependencies: &[TaskId],
    ) -> Result<TaskId, ExecutorError> {
        let graph = component
            .graph()
            .ok_or_else(|| ExecutorError::MissingGraph(component.name().to_string()))?;

        self.schedule_graph(
            &graph,
            Some(component),
            Arc::new(FetchInputElement),
            dependencies,
        )
    }

    /// Schedules `graph` with `input` running in place of its input node. No
    /// task of the graph starts before every one of `dependencies` has
    /// completed; invalid ids among them are ignored.
    pub fn schedule_graph(
        &self,
        graph: &Arc<Graph>,
        component: Option<Arc<dyn Component>>,
        input: Arc<dyn Element>,
        dependencies: &[TaskId],
    ) -> Result<TaskId, ExecutorError> {
        let compiled = self.shared.compiler.compile(graph)?;
        let external: Vec<TaskId> = dependencies.iter().copied().filter(|id| id.is_valid()).collect();

        let mut inbox = self.shared.inbox();
        let base = TaskId::new(inbox.reserve(compiled.len()));
        let id = |index: usize| base.offset(index as u64);

        let batch: Vec<ScheduledTask> = compiled
            .tasks()
            .iter()
            .enumerate()
            .map(|(index, template)| {
                let mut after: Vec<TaskId> = template.after.iter().map(|&dep| id(dep)).collect();
                if index == compiled.gate() {
                    after.extend(&external);
                }

                let element = if index == compiled.input_task() {
                    Some(input.clone())
                } else {
                    template.element.clone()
                };

                ScheduledTask {
                    id: id(index),
                    label: template.label.clone(),
                    node: template.node.clone(),
                    element,
                    component: component.clone(),
                    inputs: template.inputs.iter().map(|&dep| id(dep)).collect(),
                    after,
                }
            })
            .collect();

        let terminal = id(compiled.terminal());
        self.shared.outputs_mut().pin(terminal);
        inbox.batches.push(batch);

        tracing::debug!(
            graph = graph.name(),
            tasks = compiled.len(),
            first = %base,
            %terminal,
            "scheduled graph"
        );

        Ok(terminal)
    }

    /// Schedules an operation to run on the thread driving the executor once
    /// every one of `dependencies` has completed. The operation is invoked
    /// again on each tick until it returns `true`.
    pub fn schedule_generic<F>(&self, operation: F, dependencies: &[TaskId]) -> TaskId
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let mut inbox = self.shared.inbox();
        let id = TaskId::new(inbox.reserve(1));

        inbox.batches.push(vec![ScheduledTask {
            id,
            label: String::from("generic"),
            node: None,
            element: Some(Arc::new(GenericElement::new(operation))),
            component: None,
            inputs: Vec::new(),
            after: dependencies.iter().copied().filter(|id| id.is_valid()).collect(),
        }]);

        self.shared.outputs_mut().pin(id);
        tracing::debug!(task = %id, "scheduled generic task");
        id
    }

    /// Stored output of a completed task.
    pub fn output_data(&self, id: TaskId) -> Option<DataCollection> {
        self.shared.outputs().get(id)
    }

    /// Tells the executor the caller is done with the output of `id`. Only
    /// matters with [`OutputRetention::ReleaseConsumed`], where the output is
    /// then dropped once no scheduled task still reads it, and the task itself
    /// is forgotten on the next tick.
    pub fn release(&self, id: TaskId) {
        self.shared.outputs_mut().release(id, self.shared.retention);
    }

    pub fn cache(&self) -> &Arc<GraphCache> {
        &self.shared.cache
    }

    pub fn compiler(&self) -> &GraphCompiler {
        &self.shared.compiler
    }

    /// Drops compilations of `graph` and of every graph embedding it.
    pub fn notify_graph_changed(&self, graph: GraphId) {
        self.shared.compiler.notify_graph_changed(graph);
    }
}

impl fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorHandle")
            .field("queued", &self.shared.inbox().len())
            .field("outputs", &self.shared.outputs().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(n: u32) -> DataCollection {
        [crate::data::TaggedData::new(n)].into_iter().collect()
    }

    #[test]
    fn test_retain_keeps_consumed_outputs() {
        let mut store = OutputStore::default();
        let id = TaskId::new(0);
        store.add_reader(id);
        store.store(id, output(1), OutputRetention::Retain);
        assert!(store.consume(id, OutputRetention::Retain).is_some());
        assert!(store.data.contains_key(&id));
    }

    #[test]
    fn test_release_consumed_drops_after_last_reader() {
        let retention = OutputRetention::ReleaseConsumed;
        let mut store = OutputStore::default();
        let id = TaskId::new(0);
        store.add_reader(id);
        store.add_reader(id);
        store.store(id, output(1), retention);

        assert!(store.consume(id, retention).is_some());
        assert!(store.data.contains_key(&id));
        assert!(store.consume(id, retention).is_some());
        assert!(!store.data.contains_key(&id));
    }

    #[test]
    fn test_unread_output_is_dropped_unless_pinned() {
        let retention = OutputRetention::ReleaseConsumed;
        let mut store = OutputStore::default();

        store.store(TaskId::new(0), output(1), retention);
        assert!(!store.data.contains_key(&TaskId::new(0)));

        store.pin(TaskId::new(1));
        store.store(TaskId::new(1), output(1), retention);
        assert!(store.data.contains_key(&TaskId::new(1)));

        store.release(TaskId::new(1), retention);
        assert!(!store.data.contains_key(&TaskId::new(1)));
    }

    #[test]
    fn test_release_records_id_once() {
        let retention = OutputRetention::ReleaseConsumed;
        let mut store = OutputStore::default();
        let id = TaskId::new(3);
        store.pin(id);
        store.store(id, output(1), retention);

        store.release(id, retention);
        store.release(id, retention);
        store.release(TaskId::new(4), retention);
        assert_eq!(store.take_released(), vec![id]);
        assert!(store.take_released().is_empty());

        // retained outputs are never forgotten
        store.pin(id);
        store.release(id, OutputRetention::Retain);
        assert!(store.take_released().is_empty());
    }
}
