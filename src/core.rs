use std::fmt;

use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash used for content fingerprinting.
///
/// Fingerprints are the building blocks of cache keys: a data collection,
/// a single data item and a settings object each reduce to one `Hash32`, and
/// two values with the same fingerprint are treated as interchangeable by the
/// graph cache.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Streams anything implementing [`std::hash::Hash`] into a BLAKE3 digest.
#[derive(Default)]
pub struct Blake3Hasher(blake3::Hasher);

impl Blake3Hasher {
    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }
}

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

/// Identifier of a scheduled task.
///
/// Identifiers are handed out in increasing order by one executor and are
/// only meaningful to that executor. [`TaskId::INVALID`] is the "no task"
/// sentinel; a dependency on it is always satisfied.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    pub const INVALID: TaskId = TaskId(u64::MAX);

    pub(crate) const fn new(raw: u64) -> Self {
        TaskId(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub(crate) fn offset(self, by: u64) -> Self {
        TaskId(self.0 + by)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "TaskId({})", self.0)
        } else {
            write!(f, "TaskId(INVALID)")
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "#{}", self.0)
        } else {
            write!(f, "#invalid")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::Hash;

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(Hash32::hash(b"points"), Hash32::hash(b"points"));
        assert_ne!(Hash32::hash(b"points"), Hash32::hash(b"splines"));
    }

    #[test]
    fn test_hasher_matches_hash_impl() {
        let mut a = Blake3Hasher::default();
        (1u32, "tag").hash(&mut a);
        let mut b = Blake3Hasher::default();
        (1u32, "tag").hash(&mut b);
        assert_eq!(Hash32::from(a), Hash32::from(b));
    }

    #[test]
    fn test_hex() {
        let hex = Hash32::default().to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c == '0'));
    }

    #[test]
    fn test_invalid_task_id() {
        assert!(!TaskId::INVALID.is_valid());
        assert!(TaskId::new(0).is_valid());
        assert_eq!(TaskId::new(3).offset(2), TaskId::new(5));
        assert_eq!(format!("{}", TaskId::INVALID), "#invalid");
    }
}
