//! The payload exchanged between tasks.
//!
//! Every task reads one [`DataCollection`] and writes one. A collection is an
//! ordered list of [`TaggedData`] items: a type-erased, shared data object, a
//! [`DataUsage`] marker and a set of string tags. Items are reference counted,
//! so copying a collection from one task to the next never copies the
//! underlying data.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::{Blake3Hasher, Hash32};
use crate::settings::Settings;

/// Anything that can travel through the graph.
///
/// Implemented for every `Hash + Debug + Send + Sync + 'static` type. The
/// `Hash` bound is what lets the cache fingerprint inputs structurally.
pub trait Data: Any + Debug + Send + Sync {
    /// Content fingerprint, including the concrete type.
    fn fingerprint(&self) -> Hash32;

    fn type_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> Data for T
where
    T: Hash + Debug + Send + Sync + 'static,
{
    fn fingerprint(&self) -> Hash32 {
        let mut hasher = Blake3Hasher::default();
        std::any::type_name::<T>().hash(&mut hasher);
        self.hash(&mut hasher);
        hasher.into()
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// How a downstream element should interpret an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataUsage {
    /// Regular input, subject to tag filtering and output tagging.
    #[default]
    Input,
    Exclusion,
    /// A [`Settings`] object overriding the node's default settings.
    Settings,
    Override,
}

#[derive(Clone, Debug)]
pub struct TaggedData {
    pub data: Arc<dyn Data>,
    pub usage: DataUsage,
    pub tags: BTreeSet<String>,
}

impl TaggedData {
    pub fn new(data: impl Data) -> Self {
        Self::from_arc(Arc::new(data))
    }

    pub fn from_arc(data: Arc<dyn Data>) -> Self {
        Self {
            data,
            usage: DataUsage::Input,
            tags: BTreeSet::new(),
        }
    }

    /// Wraps settings so they override the node's defaults downstream.
    pub fn settings(settings: Arc<Settings>) -> Self {
        Self::from_arc(settings).with_usage(DataUsage::Settings)
    }

    pub fn with_usage(mut self, usage: DataUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn has_any_tag(&self, tags: &BTreeSet<String>) -> bool {
        !self.tags.is_disjoint(tags)
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.data.as_any().downcast_ref::<T>()
    }

    pub fn fingerprint(&self) -> Hash32 {
        let mut hasher = Blake3Hasher::default();
        self.hash_into(&mut hasher);
        hasher.into()
    }

    fn hash_into(&self, hasher: &mut Blake3Hasher) {
        self.usage.hash(hasher);
        self.tags.hash(hasher);
        hasher.update(self.data.fingerprint().as_bytes());
    }
}

impl PartialEq for TaggedData {
    fn eq(&self, other: &Self) -> bool {
        self.usage == other.usage
            && self.tags == other.tags
            && self.data.fingerprint() == other.data.fingerprint()
    }
}

/// Ordered, tagged payload of a task.
///
/// `cancel_execution` short-circuits the downstream chain: the flag is OR-ed
/// into every dependent's input, and cancellable elements complete without
/// running once they see it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DataCollection {
    pub tagged_data: Vec<TaggedData>,
    pub cancel_execution: bool,
}

impl DataCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancelled() -> Self {
        Self {
            tagged_data: Vec::new(),
            cancel_execution: true,
        }
    }

    pub fn push(&mut self, item: TaggedData) -> &mut Self {
        self.tagged_data.push(item);
        self
    }

    pub fn len(&self) -> usize {
        self.tagged_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tagged_data.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TaggedData> {
        self.tagged_data.iter()
    }

    pub fn inputs(&self) -> impl Iterator<Item = &TaggedData> {
        self.by_usage(DataUsage::Input)
    }

    pub fn tagged_inputs<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a TaggedData> {
        self.inputs().filter(move |item| item.has_tag(tag))
    }

    pub fn exclusions(&self) -> impl Iterator<Item = &TaggedData> {
        self.by_usage(DataUsage::Exclusion)
    }

    pub fn all_settings(&self) -> impl Iterator<Item = &TaggedData> {
        self.by_usage(DataUsage::Settings)
    }

    fn by_usage(&self, usage: DataUsage) -> impl Iterator<Item = &TaggedData> {
        self.tagged_data
            .iter()
            .filter(move |item| item.usage == usage)
    }

    /// Settings in effect for an element reading this collection: the first
    /// settings override found in the collection, otherwise `default`.
    pub fn settings(&self, default: Option<&Arc<Settings>>) -> Option<Arc<Settings>> {
        self.all_settings()
            .find_map(|item| item.data.clone().as_any_arc().downcast::<Settings>().ok())
            .or_else(|| default.cloned())
    }

    /// Concatenates `other` after this collection and propagates its
    /// cancellation.
    pub fn append(&mut self, other: &DataCollection) {
        self.tagged_data.extend(other.tagged_data.iter().cloned());
        self.cancel_execution |= other.cancel_execution;
    }

    /// Structural fingerprint: order, usage, tags and data content of every
    /// item, plus the cancellation flag.
    pub fn fingerprint(&self) -> Hash32 {
        let mut hasher = Blake3Hasher::default();
        self.cancel_execution.hash(&mut hasher);
        self.tagged_data.len().hash(&mut hasher);

        for item in &self.tagged_data {
            item.hash_into(&mut hasher);
        }

        hasher.into()
    }
}

impl FromIterator<TaggedData> for DataCollection {
    fn from_iter<I: IntoIterator<Item = TaggedData>>(iter: I) -> Self {
        Self {
            tagged_data: iter.into_iter().collect(),
            cancel_execution: false,
        }
    }
}

impl<'a> IntoIterator for &'a DataCollection {
    type Item = &'a TaggedData;
    type IntoIter = std::slice::Iter<'a, TaggedData>;

    fn into_iter(self) -> Self::IntoIter {
        self.tagged_data.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Hash)]
    struct Points(Vec<u32>);

    fn sample() -> DataCollection {
        [
            TaggedData::new(Points(vec![1, 2])).with_tag("ground"),
            TaggedData::new(Points(vec![3])).with_tags(["trees", "ground"]),
            TaggedData::new(7u32).with_usage(DataUsage::Exclusion),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_usage_views() {
        let data = sample();
        assert_eq!(data.inputs().count(), 2);
        assert_eq!(data.tagged_inputs("trees").count(), 1);
        assert_eq!(data.exclusions().count(), 1);
        assert_eq!(data.all_settings().count(), 0);
    }

    #[test]
    fn test_downcast() {
        let data = sample();
        let points = data.tagged_data[0].downcast_ref::<Points>().unwrap();
        assert_eq!(points.0, vec![1, 2]);
        assert!(data.tagged_data[0].downcast_ref::<u32>().is_none());
    }

    #[test]
    fn test_fingerprint_is_structural() {
        assert_eq!(sample().fingerprint(), sample().fingerprint());
        assert_eq!(sample(), sample());

        let mut retagged = sample();
        retagged.tagged_data[0].tags.insert("extra".into());
        assert_ne!(sample().fingerprint(), retagged.fingerprint());

        let mut reordered = sample();
        reordered.tagged_data.swap(0, 1);
        assert_ne!(sample().fingerprint(), reordered.fingerprint());

        let mut cancelled = sample();
        cancelled.cancel_execution = true;
        assert_ne!(sample().fingerprint(), cancelled.fingerprint());
    }

    #[test]
    fn test_same_content_different_type() {
        let a = TaggedData::new(1u32);
        let b = TaggedData::new(1u64);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_append_propagates_cancel() {
        let mut data = sample();
        let mut other = DataCollection::cancelled();
        other.push(TaggedData::new(9u8));
        data.append(&other);
        assert_eq!(data.len(), 4);
        assert!(data.cancel_execution);
    }

    #[test]
    fn test_settings_override() {
        let default = Arc::new(Settings::trivial());
        let data = sample();
        assert!(Arc::ptr_eq(&data.settings(Some(&default)).unwrap(), &default));
        assert!(data.settings(None).is_none());

        let custom = Arc::new(Settings::trivial().with_seed(42));
        let mut data = sample();
        data.push(TaggedData::settings(custom.clone()));
        let found = data.settings(Some(&default)).unwrap();
        assert_eq!(found.seed, 42);
    }
}
