use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::core::Hash32;
use crate::data::DataCollection;
use crate::element::{Element, ElementId};
use crate::settings::Settings;

/// Lookup key of one memoized result. Built once per execution, before the
/// element gets to touch its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    element: ElementId,
    input: Hash32,
    settings: Hash32,
}

impl CacheKey {
    /// `None` when the settings have no usable fingerprint, in which case the
    /// result must not be cached.
    pub(crate) fn new(
        element: &Arc<dyn Element>,
        input: &DataCollection,
        settings: Option<&Settings>,
    ) -> Option<Self> {
        let settings = match settings {
            Some(settings) => settings.fingerprint()?,
            None => Hash32::default(),
        };

        Some(Self {
            element: ElementId::of(element),
            input: input.fingerprint(),
            settings,
        })
    }
}

#[derive(Debug)]
struct CacheEntry {
    /// Keeps the element allocation, and therefore its id, reserved for as
    /// long as the entry exists.
    element: Weak<dyn Element>,
    output: DataCollection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Memoized element results, keyed by element identity and the fingerprints
/// of the (filtered) input and the settings in effect.
///
/// The map is sharded, so lookups and stores on unrelated keys from different
/// workers never wait on each other. Entries live until cleaned explicitly;
/// entries of elements that were dropped can be swept with
/// [`GraphCache::clean_dropped_elements`].
#[derive(Debug, Default)]
pub struct GraphCache {
    entries: DashMap<CacheKey, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl GraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_from_cache(
        &self,
        element: &Arc<dyn Element>,
        input: &DataCollection,
        settings: Option<&Settings>,
    ) -> Option<DataCollection> {
        let key = CacheKey::new(element, input, settings)?;
        self.lookup(&key)
    }

    /// Stores `output` for the key. A concurrent store of the same key keeps
    /// whichever lands last; both values are equivalent.
    pub fn store_in_cache(
        &self,
        element: &Arc<dyn Element>,
        input: &DataCollection,
        settings: Option<&Settings>,
        output: &DataCollection,
    ) {
        if let Some(key) = CacheKey::new(element, input, settings) {
            self.insert(key, element, output);
        }
    }

    pub(crate) fn lookup(&self, key: &CacheKey) -> Option<DataCollection> {
        match self.entries.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.output.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub(crate) fn insert(&self, key: CacheKey, element: &Arc<dyn Element>, output: &DataCollection) {
        self.entries.insert(
            key,
            CacheEntry {
                element: Arc::downgrade(element),
                output: output.clone(),
            },
        );
    }

    /// Drops every entry produced by `element`.
    pub fn clean_from_cache(&self, element: ElementId) {
        self.entries.retain(|key, _| key.element != element);
    }

    /// Drops the entries of elements nothing refers to anymore, such as the
    /// previous element of a node whose settings were replaced.
    pub fn clean_dropped_elements(&self) {
        self.entries.retain(|_, entry| entry.element.strong_count() > 0);
    }

    pub fn clear_cache(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}
