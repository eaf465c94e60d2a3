//! Tick-driven task executor.
//!
//! Work is scheduled through an [`ExecutorHandle`] from any thread and picked
//! up by [`Executor::execute`], which performs one tick:
//!
//! 1. newly scheduled batches are moved into the task table,
//! 2. results sent back by workers are collected; completed outputs are
//!    stored and their dependents are promoted once nothing else holds them,
//! 3. ready tasks are activated in scheduling order, their input assembled
//!    from the outputs of their data dependencies,
//! 4. every active task that is not paused is invoked, on the driving thread
//!    when its element asks for it (or when there is no pool), otherwise on
//!    the worker pool.
//!
//! A task whose element returns `false` stays active with its context and is
//! invoked again on a later tick.

mod diagnostics;
mod handle;
mod task;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};

use crate::cache::GraphCache;
use crate::compiler::GraphCompiler;
use crate::component::Component;
use crate::config::{ExecutorConfig, OutputRetention};
use crate::context::Context;
use crate::core::TaskId;
use crate::data::DataCollection;
use crate::debug::DebugDisplay;
use crate::element::Element;
use crate::error::ExecutorError;
use crate::graph::Graph;

use self::handle::Shared;
use self::task::{Entry, Finished, Run};

pub use diagnostics::{Audit, Diagnostics, TaskRecord};
pub use handle::ExecutorHandle;
pub use task::TaskState;

pub struct Executor {
    shared: Arc<Shared>,
    handle: ExecutorHandle,
    pool: Option<rayon::ThreadPool>,
    sender: Sender<Finished>,
    receiver: Receiver<Finished>,
    tasks: BTreeMap<TaskId, Entry>,
    /// Tasks waiting on a dependency that has not completed yet.
    dependents: HashMap<TaskId, Vec<TaskId>>,
    ready: BTreeSet<TaskId>,
    completed: HashSet<TaskId>,
    failed: BTreeMap<TaskId, String>,
    in_flight: usize,
    debug: Option<Arc<dyn DebugDisplay>>,
    diagnostics: Diagnostics,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Result<Self, ExecutorError> {
        let pool = match config.worker_threads {
            0 => None,
            threads => {
                let prefix = config.thread_name_prefix.clone();
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(move |index| format!("{prefix}-{index}"))
                    .build()?;
                Some(pool)
            }
        };

        let shared = Arc::new(Shared::new(config.retention));
        let (sender, receiver) = channel();

        tracing::debug!(
            workers = config.worker_threads,
            retention = ?config.retention,
            "created executor"
        );

        Ok(Self {
            handle: ExecutorHandle {
                shared: shared.clone(),
            },
            shared,
            pool,
            sender,
            receiver,
            tasks: BTreeMap::new(),
            dependents: HashMap::new(),
            ready: BTreeSet::new(),
            completed: HashSet::new(),
            failed: BTreeMap::new(),
            in_flight: 0,
            debug: None,
            diagnostics: Diagnostics::with_capacity(config.diagnostics_capacity),
        })
    }

    /// Routes `Debug` and `Isolated` nodes to `display` instead of the log.
    pub fn with_debug_display(mut self, display: Arc<dyn DebugDisplay>) -> Self {
        self.debug = Some(display);
        self
    }

    pub fn handle(&self) -> ExecutorHandle {
        self.handle.clone()
    }

    pub fn schedule(
        &self,
        component: Arc<dyn Component>,
        dependencies: &[TaskId],
    ) -> Result<TaskId, ExecutorError> {
        self.handle.schedule(component, dependencies)
    }

    pub fn schedule_graph(
        &self,
        graph: &Arc<Graph>,
        component: Option<Arc<dyn Component>>,
        input: Arc<dyn Element>,
        dependencies: &[TaskId],
    ) -> Result<TaskId, ExecutorError> {
        self.handle.schedule_graph(graph, component, input, dependencies)
    }

    pub fn schedule_generic<F>(&self, operation: F, dependencies: &[TaskId]) -> TaskId
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.handle.schedule_generic(operation, dependencies)
    }

    pub fn output_data(&self, id: TaskId) -> Option<DataCollection> {
        self.handle.output_data(id)
    }

    /// Gives up the output of `id`. Under
    /// [`OutputRetention::ReleaseConsumed`] the executor forgets the task as
    /// well, so it can no longer be depended on.
    pub fn release(&mut self, id: TaskId) {
        self.handle.release(id);
        self.prune_released();
    }

    pub fn cache(&self) -> &Arc<GraphCache> {
        &self.shared.cache
    }

    pub fn compiler(&self) -> &GraphCompiler {
        &self.shared.compiler
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Runs one tick.
    pub fn execute(&mut self) {
        self.tick();
    }

    /// Ticks until every scheduled task has completed, waiting on workers when
    /// they are the only ones with work left. Returns `false` when the
    /// remaining tasks cannot make progress on their own: they are paused, or
    /// waiting on a task that failed. See [`Executor::audit`].
    pub fn flush(&mut self) -> bool {
        loop {
            self.tick();

            if self.is_idle() {
                return true;
            }

            if self.has_runnable() || self.shared.inbox().len() > 0 {
                continue;
            }

            if self.in_flight > 0 {
                if let Ok(finished) = self.receiver.recv() {
                    self.in_flight -= 1;
                    self.finish(finished.id, finished.run, finished.result);
                }
                continue;
            }

            tracing::warn!(left = self.tasks.len(), "executor stalled");
            return false;
        }
    }

    /// No task scheduled, waiting, running or paused.
    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty() && self.shared.inbox().len() == 0
    }

    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        if self.completed.contains(&id) {
            return Some(TaskState::Completed);
        }

        if self.failed.contains_key(&id) {
            return Some(TaskState::Failed);
        }

        if let Some(entry) = self.tasks.get(&id) {
            return Some(entry.state);
        }

        let queued = self
            .shared
            .inbox()
            .batches
            .iter()
            .flatten()
            .any(|task| task.id == id);

        queued.then_some(TaskState::Pending)
    }

    /// Reports failed tasks and the pending tasks they hold back.
    pub fn audit(&self) -> Audit {
        let mut stalled: BTreeSet<TaskId> = BTreeSet::new();

        // Dependencies still registered in `dependents` have not completed.
        let blocks = |id: TaskId, dep: TaskId, stalled: &BTreeSet<TaskId>| {
            self.failed.contains_key(&dep)
                || stalled.contains(&dep)
                || (!self.tasks.contains_key(&dep)
                    && self
                        .dependents
                        .get(&dep)
                        .is_some_and(|waiting| waiting.contains(&id)))
        };

        loop {
            let found: Vec<TaskId> = self
                .tasks
                .values()
                .filter(|entry| entry.state == TaskState::Pending)
                .filter(|entry| !stalled.contains(&entry.task.id))
                .filter(|entry| {
                    let id = entry.task.id;
                    entry.task.dependencies().any(|dep| blocks(id, dep, &stalled))
                })
                .map(|entry| entry.task.id)
                .collect();

            if found.is_empty() {
                break;
            }

            stalled.extend(found);
        }

        Audit {
            failed: self
                .failed
                .iter()
                .map(|(id, msg)| (*id, msg.clone()))
                .collect(),
            stalled: stalled.into_iter().collect(),
            paused: self
                .tasks
                .values()
                .filter(|entry| entry.is_paused())
                .map(|entry| entry.task.id)
                .collect(),
        }
    }

    /// Drops the tasks [`Executor::audit`] reports as stalled and returns
    /// their ids.
    pub fn discard_stalled(&mut self) -> Vec<TaskId> {
        let stalled = self.audit().stalled;

        let mut outputs = self.shared.outputs_mut();
        for id in &stalled {
            if let Some(entry) = self.tasks.remove(id) {
                for input in &entry.task.inputs {
                    outputs.forget_reader(*input, self.shared.retention);
                }
            }
        }

        if !stalled.is_empty() {
            tracing::warn!(count = stalled.len(), "discarded stalled tasks");
        }

        stalled
    }

    /// Forgets every stored output and restarts task ids from zero. Only
    /// possible when the executor is idle, so no id still in use is reused.
    pub fn clear_results(&mut self) -> Result<(), ExecutorError> {
        let mut inbox = self.shared.inbox();

        let busy = self.tasks.len() + inbox.len();
        if busy > 0 {
            return Err(ExecutorError::NotIdle(busy));
        }

        inbox.next_id = 0;
        self.shared.outputs_mut().clear();
        self.completed.clear();
        self.failed.clear();
        self.dependents.clear();
        self.diagnostics.clear();
        self.shared.cache.clean_dropped_elements();

        tracing::debug!("cleared results");
        Ok(())
    }

    fn tick(&mut self) {
        self.prune_released();
        self.drain_inbox();
        self.collect_finished();

        let ready = std::mem::take(&mut self.ready);
        for id in ready {
            self.activate(id);
        }

        let runnable: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|entry| entry.is_runnable())
            .map(|entry| entry.task.id)
            .collect();

        for id in runnable {
            self.dispatch(id);
        }
    }

    fn prune_released(&mut self) {
        let released = self.shared.outputs_mut().take_released();
        for id in released {
            self.completed.remove(&id);
            self.diagnostics.forget(id);
        }
    }

    fn has_runnable(&self) -> bool {
        !self.ready.is_empty() || self.tasks.values().any(Entry::is_runnable)
    }

    fn drain_inbox(&mut self) {
        let batches = std::mem::take(&mut self.shared.inbox().batches);

        for task in batches.into_iter().flatten() {
            let id = task.id;

            {
                let mut outputs = self.shared.outputs_mut();
                for input in &task.inputs {
                    outputs.add_reader(*input);
                }
            }

            let mut waiting = 0;
            for dep in task.dependencies() {
                if !self.completed.contains(&dep) {
                    waiting += 1;
                    self.dependents.entry(dep).or_default().push(id);
                }
            }

            let state = if waiting == 0 {
                self.ready.insert(id);
                TaskState::Ready
            } else {
                TaskState::Pending
            };

            self.tasks.insert(
                id,
                Entry {
                    task,
                    state,
                    waiting,
                    run: None,
                },
            );
        }
    }

    fn collect_finished(&mut self) {
        while let Ok(finished) = self.receiver.try_recv() {
            self.in_flight -= 1;
            self.finish(finished.id, finished.run, finished.result);
        }
    }

    fn activate(&mut self, id: TaskId) {
        let Some(entry) = self.tasks.get_mut(&id) else {
            return;
        };

        let mut input = DataCollection::default();
        {
            let mut outputs = self.shared.outputs_mut();
            for dep in &entry.task.inputs {
                if let Some(output) = outputs.consume(*dep, self.shared.retention) {
                    input.append(&output);
                }
            }
        }

        let span = tracing::info_span!("task", id = %id, name = %entry.task.label);
        let mut context = Context::new(input).with_task(id, span);
        context.node = entry.task.node.clone();
        context.component = entry.task.component.clone();
        context.cache = Some(self.shared.cache.clone());
        context.executor = Some(self.handle.clone());
        context.debug = self.debug.clone();

        entry.state = TaskState::Active;
        entry.run = Some(Run {
            element: entry.task.element(),
            context,
        });
    }

    fn dispatch(&mut self, id: TaskId) {
        let Some(mut run) = self.tasks.get_mut(&id).and_then(|entry| entry.run.take()) else {
            return;
        };

        let pool = self
            .pool
            .as_ref()
            .filter(|_| !run.element.requires_main_thread());

        if let Some(pool) = pool {
            let sender = self.sender.clone();
            pool.spawn(move || {
                let result = run.invoke();
                // The executor may be gone already.
                let _ = sender.send(Finished { id, run, result });
            });
            self.in_flight += 1;
            return;
        }

        let result = run.invoke();
        self.finish(id, run, result);
    }

    fn finish(&mut self, id: TaskId, run: Run, result: anyhow::Result<bool>) {
        match result {
            Ok(true) => self.complete(id, run.context),
            Ok(false) => {
                if let Some(entry) = self.tasks.get_mut(&id) {
                    entry.run = Some(run);
                }
            }
            Err(err) => {
                tracing::error!(task = %id, "task failed: {err:#}");
                self.tasks.remove(&id);
                self.failed.insert(id, format!("{err:#}"));
            }
        }
    }

    fn complete(&mut self, id: TaskId, context: Context) {
        let Some(entry) = self.tasks.remove(&id) else {
            return;
        };

        tracing::trace!(
            task = %id,
            name = %entry.task.label,
            items = context.output_data.len(),
            cancelled = context.output_data.cancel_execution,
            "task completed"
        );

        self.diagnostics.push(TaskRecord {
            id,
            label: entry.task.label,
            inputs: entry.task.inputs,
            elapsed: context.elapsed(),
            executions: context.execution_count(),
            cache_hit: context.was_cache_hit(),
        });

        // Unpinned tasks are only known to their own batch, whose dependents
        // are all registered already.
        let keep = {
            let mut outputs = self.shared.outputs_mut();
            outputs.store(id, context.output_data, self.shared.retention);
            self.shared.retention == OutputRetention::Retain || outputs.is_pinned(id)
        };
        if keep {
            self.completed.insert(id);
        }

        for dependent in self.dependents.remove(&id).unwrap_or_default() {
            if let Some(entry) = self.tasks.get_mut(&dependent) {
                entry.waiting -= 1;
                if entry.waiting == 0 && entry.state == TaskState::Pending {
                    entry.state = TaskState::Ready;
                    self.ready.insert(dependent);
                }
            }
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("tasks", &self.tasks.len())
            .field("ready", &self.ready.len())
            .field("in_flight", &self.in_flight)
            .field("completed", &self.completed.len())
            .field("failed", &self.failed.len())
            .finish_non_exhaustive()
    }
}
