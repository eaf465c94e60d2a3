//! The execution contract every node implements.
//!
//! An [`Element`] only provides the core logic through
//! [`Element::execute_internal`]. Everything around it (cancellation, disabled
//! nodes, tag filtering, caching, output tagging and debug display) is applied
//! uniformly by [`<dyn Element>::execute`](trait.Element.html#method.execute),
//! so that no element can skip or reorder those steps.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::cache::CacheKey;
use crate::context::Context;
use crate::data::{DataCollection, DataUsage, TaggedData};
use crate::debug::{DebugDisplay, LogDebugDisplay};
use crate::settings::{ExecutionMode, Settings};

pub trait Element: Send + Sync {
    /// Core logic. Returns `Ok(true)` when done, `Ok(false)` to be invoked
    /// again on a later tick with the same context.
    fn execute_internal(&self, ctx: &mut Context) -> anyhow::Result<bool>;

    /// Whether results may be reused for an identical (input, settings) pair.
    fn is_cacheable(&self, _settings: Option<&Settings>) -> bool {
        true
    }

    /// Whether a cancelled input completes the task without running it.
    fn is_cancellable(&self) -> bool {
        true
    }

    fn requires_main_thread(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Identity of an element instance. Two settings sharing one `Arc` share a
/// cache namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId(usize);

impl ElementId {
    pub fn of(element: &Arc<dyn Element>) -> Self {
        Self(Arc::as_ptr(element) as *const () as usize)
    }
}

/// What an unfinished execution keeps for its next invocation.
pub(crate) struct Resume {
    /// Inputs set aside by the tag filter.
    bypassed: Vec<TaggedData>,
    /// Taken before the element could touch its input.
    key: Option<CacheKey>,
}

impl dyn Element {
    /// Runs the element on `ctx`, wrapping the core logic in the fixed
    /// execution pipeline. Returns `Ok(true)` once the task is done.
    pub fn execute(self: &Arc<Self>, ctx: &mut Context) -> anyhow::Result<bool> {
        let cancelled = ctx.input_data.cancel_execution;

        if cancelled {
            ctx.output_data.cancel_execution = true;

            if self.is_cancellable() {
                return Ok(true);
            }
        }

        let settings = ctx.settings();

        if let Some(settings) = &settings
            && settings.execution_mode == ExecutionMode::Disabled
        {
            ctx.output_data = ctx.input_data.clone();
            return Ok(true);
        }

        let cacheable = self.is_cacheable(settings.as_deref());
        let cache = ctx.cache.clone().filter(|_| cacheable);

        // Filtering, keying and lookup happen on the first invocation only.
        let (resume, hit) = match ctx.resume.take() {
            Some(resume) => (resume, None),
            None => {
                let bypassed = filter_inputs(ctx, settings.as_deref());
                let key = cache
                    .as_ref()
                    .and_then(|_| CacheKey::new(self, &ctx.input_data, settings.as_deref()));
                let hit = cache
                    .as_ref()
                    .zip(key.as_ref())
                    .and_then(|(cache, key)| cache.lookup(key));

                (Resume { bypassed, key }, hit)
            }
        };

        if let Some(output) = hit {
            tracing::debug!(task = %ctx.task_id, element = self.name(), "cache hit");
            ctx.output_data = output;
            ctx.cache_hit = true;
        } else {
            let start = Instant::now();
            let done = self.execute_internal(ctx);
            ctx.elapsed += start.elapsed();
            ctx.execution_count += 1;

            if !done? {
                ctx.resume = Some(resume);
                return Ok(false);
            }

            if let (Some(cache), Some(key)) = (&cache, resume.key) {
                cache.insert(key, self, &ctx.output_data);
            }
        }

        if let Some(settings) = &settings
            && !settings.tags_applied_on_output.is_empty()
        {
            for item in &mut ctx.output_data.tagged_data {
                if item.usage == DataUsage::Input {
                    item.tags
                        .extend(settings.tags_applied_on_output.iter().cloned());
                }
            }
        }

        ctx.output_data.tagged_data.extend(resume.bypassed);
        ctx.output_data.cancel_execution |= cancelled;

        if let Some(settings) = &settings {
            match settings.execution_mode {
                ExecutionMode::Debug | ExecutionMode::Isolated => {
                    match ctx.debug.clone() {
                        Some(display) => display.display(ctx, settings),
                        None => LogDebugDisplay.display(ctx, settings),
                    }

                    if settings.execution_mode == ExecutionMode::Isolated {
                        ctx.output_data.cancel_execution = true;
                    }
                }
                ExecutionMode::Enabled | ExecutionMode::Disabled => {}
            }
        }

        Ok(true)
    }
}

/// Narrows the context input to what the element should see and returns the
/// items to hand through untouched.
fn filter_inputs(ctx: &mut Context, settings: Option<&Settings>) -> Vec<TaggedData> {
    let Some(settings) = settings.filter(|s| !s.filter_on_tags.is_empty()) else {
        return Vec::new();
    };

    let (kept, filtered_out): (Vec<_>, Vec<_>) = std::mem::take(&mut ctx.input_data.tagged_data)
        .into_iter()
        .partition(|item| item.usage != DataUsage::Input || item.has_any_tag(&settings.filter_on_tags));

    ctx.input_data.tagged_data = kept;

    if settings.pass_through_filtered_out_inputs {
        filtered_out
    } else {
        Vec::new()
    }
}

/// Hands its input through unchanged. Used for graph input and output nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrivialElement;

impl Element for TrivialElement {
    fn execute_internal(&self, ctx: &mut Context) -> anyhow::Result<bool> {
        ctx.output_data = ctx.input_data.clone();
        Ok(true)
    }

    fn is_cacheable(&self, _: Option<&Settings>) -> bool {
        false
    }

    fn name(&self) -> &str {
        "Trivial"
    }
}

/// Produces nothing. Gates the roots of a scheduled graph behind its external
/// dependencies.
#[derive(Debug, Default, Clone, Copy)]
pub struct BarrierElement;

impl Element for BarrierElement {
    fn execute_internal(&self, ctx: &mut Context) -> anyhow::Result<bool> {
        ctx.output_data = DataCollection::default();
        Ok(true)
    }

    fn is_cacheable(&self, _: Option<&Settings>) -> bool {
        false
    }

    fn is_cancellable(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "Barrier"
    }
}

/// Feeds a graph: the task input followed by the source component's own data.
#[derive(Debug, Default, Clone, Copy)]
pub struct FetchInputElement;

impl Element for FetchInputElement {
    fn execute_internal(&self, ctx: &mut Context) -> anyhow::Result<bool> {
        let mut output = ctx.input_data.clone();

        if let Some(data) = ctx.component().and_then(|component| component.input_data()) {
            output.append(&data);
        }

        ctx.output_data = output;
        Ok(true)
    }

    fn is_cacheable(&self, _: Option<&Settings>) -> bool {
        false
    }

    fn name(&self) -> &str {
        "FetchInput"
    }
}

/// Feeds a graph with a fixed collection, captured when the graph was
/// scheduled.
#[derive(Debug, Clone)]
pub struct InputForwardingElement {
    input: DataCollection,
}

impl InputForwardingElement {
    pub fn new(input: DataCollection) -> Self {
        Self { input }
    }
}

impl Element for InputForwardingElement {
    fn execute_internal(&self, ctx: &mut Context) -> anyhow::Result<bool> {
        ctx.output_data = self.input.clone();
        Ok(true)
    }

    fn is_cacheable(&self, _: Option<&Settings>) -> bool {
        false
    }

    fn name(&self) -> &str {
        "InputForwarding"
    }
}

type Operation = Box<dyn FnMut() -> bool + Send>;

/// Wraps an arbitrary operation as a task. The operation runs on the thread
/// driving the executor and is retried on the next tick while it returns
/// `false`.
pub struct GenericElement {
    operation: Mutex<Operation>,
}

impl GenericElement {
    pub fn new<F>(operation: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        Self {
            operation: Mutex::new(Box::new(operation)),
        }
    }
}

impl Element for GenericElement {
    fn execute_internal(&self, _: &mut Context) -> anyhow::Result<bool> {
        let mut operation = self.operation.lock().unwrap_or_else(PoisonError::into_inner);
        Ok((operation)())
    }

    fn is_cacheable(&self, _: Option<&Settings>) -> bool {
        false
    }

    fn is_cancellable(&self) -> bool {
        false
    }

    fn requires_main_thread(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "Generic"
    }
}

impl fmt::Debug for GenericElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericElement").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cache::GraphCache;
    use crate::graph::Graph;

    #[derive(Debug, Hash)]
    struct Points(u32);

    /// Emits one item per visible input and counts its invocations.
    #[derive(Default)]
    struct CountInputs {
        calls: AtomicUsize,
    }

    impl Element for CountInputs {
        fn execute_internal(&self, ctx: &mut Context) -> anyhow::Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.output_data = ctx.input_data.inputs().cloned().collect();
            Ok(true)
        }
    }

    fn context_for(settings: Settings, input: DataCollection) -> Context {
        let graph = Graph::new("test");
        let id = graph.add_node("node", settings);
        Context::new(input).with_node(graph.node(id).unwrap())
    }

    fn tagged(n: u32, tag: &str) -> TaggedData {
        TaggedData::new(Points(n)).with_tag(tag)
    }

    #[test]
    fn test_cancelled_input_short_circuits() {
        let element = Arc::new(CountInputs::default());
        let settings = Settings::from_element(element.clone());
        let mut ctx = context_for(settings.clone(), DataCollection::cancelled());

        assert!(settings.element.execute(&mut ctx).unwrap());
        assert!(ctx.output_data.cancel_execution);
        assert_eq!(element.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_disabled_forwards_input() {
        let element = Arc::new(CountInputs::default());
        let settings =
            Settings::from_element(element.clone()).with_mode(ExecutionMode::Disabled);
        let input: DataCollection = [tagged(1, "a"), tagged(2, "b")].into_iter().collect();
        let mut ctx = context_for(settings.clone(), input.clone());

        assert!(settings.element.execute(&mut ctx).unwrap());
        assert_eq!(ctx.output_data, input);
        assert_eq!(element.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_filter_with_pass_through() {
        let element = Arc::new(CountInputs::default());
        let settings = Settings::from_element(element.clone())
            .with_filter_tags(["keep"])
            .with_output_tags(["done"]);
        let input: DataCollection = [tagged(1, "keep"), tagged(2, "drop"), tagged(3, "keep")]
            .into_iter()
            .collect();
        let mut ctx = context_for(settings.clone(), input);

        assert!(settings.element.execute(&mut ctx).unwrap());
        assert_eq!(ctx.input_data.len(), 2);
        assert_eq!(ctx.output_data.len(), 3);

        // element results are tagged, the bypassed item is not, and comes last
        let out = &ctx.output_data.tagged_data;
        assert!(out[0].has_tag("done") && out[1].has_tag("done"));
        assert!(!out[2].has_tag("done"));
        assert_eq!(out[2].downcast_ref::<Points>().unwrap().0, 2);
    }

    #[test]
    fn test_filter_without_pass_through() {
        let settings = Settings::new(CountInputs::default())
            .with_filter_tags(["keep"])
            .with_pass_through(false);
        let input: DataCollection = [tagged(1, "keep"), tagged(2, "drop")].into_iter().collect();
        let mut ctx = context_for(settings.clone(), input);

        assert!(settings.element.execute(&mut ctx).unwrap());
        assert_eq!(ctx.output_data.len(), 1);
    }

    #[test]
    fn test_cache_hit_skips_element() {
        let element = Arc::new(CountInputs::default());
        let settings = Settings::from_element(element.clone());
        let cache = Arc::new(GraphCache::new());
        let input: DataCollection = [tagged(1, "a"), tagged(2, "b")].into_iter().collect();

        let mut first = context_for(settings.clone(), input.clone()).with_cache(cache.clone());
        assert!(settings.element.execute(&mut first).unwrap());
        assert!(!first.was_cache_hit());

        let mut second = context_for(settings.clone(), input).with_cache(cache.clone());
        assert!(settings.element.execute(&mut second).unwrap());
        assert!(second.was_cache_hit());
        assert_eq!(second.execution_count(), 0);

        assert_eq!(element.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.output_data, second.output_data);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_key_ignores_consumed_input() {
        /// Takes its input and reports how many items it got.
        struct CountTaken;

        impl Element for CountTaken {
            fn execute_internal(&self, ctx: &mut Context) -> anyhow::Result<bool> {
                let taken = std::mem::take(&mut ctx.input_data);
                ctx.output_data.push(TaggedData::new(taken.len() as u32));
                Ok(true)
            }
        }

        let settings = Settings::new(CountTaken);
        let cache = Arc::new(GraphCache::new());
        let counts = |ctx: &Context| -> Vec<u32> {
            ctx.output_data
                .iter()
                .filter_map(|item| item.downcast_ref::<u32>().copied())
                .collect()
        };

        let three: DataCollection = [tagged(1, "a"), tagged(2, "a"), tagged(3, "a")]
            .into_iter()
            .collect();
        let mut first = context_for(settings.clone(), three.clone()).with_cache(cache.clone());
        assert!(settings.element.execute(&mut first).unwrap());
        assert_eq!(counts(&first), vec![3]);

        let mut empty = context_for(settings.clone(), DataCollection::default())
            .with_cache(cache.clone());
        assert!(settings.element.execute(&mut empty).unwrap());
        assert!(!empty.was_cache_hit());
        assert_eq!(counts(&empty), vec![0]);

        let mut again = context_for(settings.clone(), three).with_cache(cache.clone());
        assert!(settings.element.execute(&mut again).unwrap());
        assert!(again.was_cache_hit());
        assert_eq!(counts(&again), vec![3]);
    }

    #[test]
    fn test_reentry_looks_up_cache_once() {
        /// Needs three invocations, then forwards its input.
        #[derive(Default)]
        struct ThreeSteps {
            calls: AtomicUsize,
        }

        impl Element for ThreeSteps {
            fn execute_internal(&self, ctx: &mut Context) -> anyhow::Result<bool> {
                if self.calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Ok(false);
                }
                ctx.output_data = ctx.input_data.clone();
                Ok(true)
            }
        }

        let settings = Settings::new(ThreeSteps::default());
        let cache = Arc::new(GraphCache::new());
        let input: DataCollection = [tagged(1, "a")].into_iter().collect();
        let mut ctx = context_for(settings.clone(), input.clone()).with_cache(cache.clone());

        while !settings.element.execute(&mut ctx).unwrap() {}

        assert_eq!(ctx.execution_count(), 3);
        assert_eq!(ctx.output_data, input);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_isolated_cancels_output() {
        let settings = Settings::new(CountInputs::default()).with_mode(ExecutionMode::Isolated);
        let input: DataCollection = [tagged(1, "a")].into_iter().collect();
        let mut ctx = context_for(settings.clone(), input);

        assert!(settings.element.execute(&mut ctx).unwrap());
        assert_eq!(ctx.output_data.len(), 1);
        assert!(ctx.output_data.cancel_execution);
    }

    #[test]
    fn test_generic_retries_until_true() {
        let mut left = 2;
        let element: Arc<dyn Element> = Arc::new(GenericElement::new(move || {
            left -= 1;
            left == 0
        }));
        let mut ctx = Context::new(DataCollection::default());

        assert!(!element.execute(&mut ctx).unwrap());
        assert!(element.execute(&mut ctx).unwrap());
        assert_eq!(ctx.execution_count(), 2);
        assert!(element.requires_main_thread());
    }

    #[test]
    fn test_error_propagates() {
        struct Broken;

        impl Element for Broken {
            fn execute_internal(&self, _: &mut Context) -> anyhow::Result<bool> {
                anyhow::bail!("no points")
            }
        }

        let element: Arc<dyn Element> = Arc::new(Broken);
        let mut ctx = Context::new(DataCollection::default());
        let err = element.execute(&mut ctx).unwrap_err();
        assert_eq!(err.to_string(), "no points");
    }

    #[test]
    fn test_element_ids_follow_allocation() {
        let a: Arc<dyn Element> = Arc::new(TrivialElement);
        let b: Arc<dyn Element> = Arc::new(TrivialElement);
        assert_eq!(ElementId::of(&a), ElementId::of(&a.clone()));
        assert_ne!(ElementId::of(&a), ElementId::of(&b));
    }
}
