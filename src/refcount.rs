//! Reference counter contract consumed by the volume cache.
//!
//! The persistent counter store lives outside this crate; the cache only
//! needs "increment and tell me the total" and "decrement and tell me the
//! total". Each object carries two counters: a normal count that goes up and
//! down with every holder, and a binary flag that is either set or clear no
//! matter how many times it is taken. The value returned is their sum.

use crate::error::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Which counter of an object to adjust.
///
/// Orders binary first, the order activation rollback undoes them in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RefMode {
    /// Flag: `get` sets it to one, `put` clears it.
    Binary,
    /// Counted: every `get` adds one.
    Normal,
}

impl RefMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefMode::Normal => "normal",
            RefMode::Binary => "binary",
        }
    }
}

impl std::fmt::Display for RefMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent per-namespace reference counter.
pub trait RefCounter: Send + Sync {
    /// Increment and return the object's new total.
    fn get(&self, object_id: &str, mode: RefMode, namespace: &str) -> Result<u32>;

    /// Decrement (never below zero) and return the object's new total.
    fn put(&self, object_id: &str, mode: RefMode, namespace: &str) -> Result<u32>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counts {
    normal: u32,
    binary: bool,
}

impl Counts {
    fn total(&self) -> u32 {
        self.normal + u32::from(self.binary)
    }
}

/// Reference counter kept in process memory.
///
/// Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct MemoryRefCounter {
    counts: Arc<Mutex<HashMap<(String, String), Counts>>>,
}

impl MemoryRefCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<(String, String), Counts>> {
        self.counts.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Current total for an object without changing it.
    pub fn count(&self, object_id: &str, namespace: &str) -> u32 {
        self.counts()
            .get(&(namespace.to_string(), object_id.to_string()))
            .map(Counts::total)
            .unwrap_or(0)
    }
}

impl RefCounter for MemoryRefCounter {
    fn get(&self, object_id: &str, mode: RefMode, namespace: &str) -> Result<u32> {
        let mut counts = self.counts();
        let entry = counts
            .entry((namespace.to_string(), object_id.to_string()))
            .or_default();
        match mode {
            RefMode::Normal => entry.normal += 1,
            RefMode::Binary => entry.binary = true,
        }
        Ok(entry.total())
    }

    fn put(&self, object_id: &str, mode: RefMode, namespace: &str) -> Result<u32> {
        let mut counts = self.counts();
        let key = (namespace.to_string(), object_id.to_string());
        let Some(entry) = counts.get_mut(&key) else {
            return Ok(0);
        };
        match mode {
            RefMode::Normal => entry.normal = entry.normal.saturating_sub(1),
            RefMode::Binary => entry.binary = false,
        }
        let total = entry.total();
        if total == 0 {
            counts.remove(&key);
        }
        Ok(total)
    }
}
