//! Execution context domain types

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Resumable key-value state attached to a job or step execution
///
/// Persisted and loaded as a unit. Tracks whether it has been modified since
/// it was created or last marked clean.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    entries: BTreeMap<String, JsonValue>,
    #[serde(skip)]
    dirty: bool,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a clean context from persisted entries
    pub fn from_entries(entries: BTreeMap<String, JsonValue>) -> Self {
        Self {
            entries,
            dirty: false,
        }
    }

    /// Stores any serializable value under `key`
    pub fn put<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.put_value(key, value);
        Ok(())
    }

    pub fn put_value(&mut self, key: impl Into<String>, value: JsonValue) {
        let key = key.into();
        if self.entries.get(&key) != Some(&value) {
            self.entries.insert(key, value);
            self.dirty = true;
        }
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.entries.get(key)
    }

    /// Reads `key` back as `T`
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        self.entries
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
    }

    pub fn remove(&mut self, key: &str) -> Option<JsonValue> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn entries(&self) -> &BTreeMap<String, JsonValue> {
        &self.entries
    }
}

// The dirty flag is bookkeeping, not content.
impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

/// The execution a context belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextOwner {
    Job(Uuid),
    Step(Uuid),
}

impl ContextOwner {
    pub fn kind(&self) -> &'static str {
        match self {
            ContextOwner::Job(_) => "JOB",
            ContextOwner::Step(_) => "STEP",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            ContextOwner::Job(id) | ContextOwner::Step(id) => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get_typed() {
        let mut ctx = ExecutionContext::new();
        assert!(!ctx.is_dirty());

        ctx.put("offset", 1200u64).unwrap();
        ctx.put("files", vec!["a.csv", "b.csv"]).unwrap();

        assert!(ctx.is_dirty());
        assert_eq!(ctx.get_as::<u64>("offset").unwrap(), Some(1200));
        assert_eq!(
            ctx.get_as::<Vec<String>>("files").unwrap(),
            Some(vec!["a.csv".to_string(), "b.csv".to_string()])
        );
        assert_eq!(ctx.get_as::<u64>("missing").unwrap(), None);
    }

    #[test]
    fn test_rewriting_same_value_stays_clean() {
        let mut ctx = ExecutionContext::new();
        ctx.put("offset", 5).unwrap();
        ctx.clear_dirty();

        ctx.put("offset", 5).unwrap();
        assert!(!ctx.is_dirty());

        ctx.remove("offset");
        assert!(ctx.is_dirty());
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_equality_ignores_dirty_flag() {
        let mut written = ExecutionContext::new();
        written.put("cursor", "abc").unwrap();

        let loaded = ExecutionContext::from_entries(written.entries().clone());
        assert!(!loaded.is_dirty());
        assert_eq!(written, loaded);
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let mut ctx = ExecutionContext::new();
        ctx.put("count", 3).unwrap();
        assert_eq!(serde_json::to_string(&ctx).unwrap(), r#"{"count":3}"#);
    }

    #[test]
    fn test_owner_kind() {
        let id = Uuid::new_v4();
        assert_eq!(ContextOwner::Job(id).kind(), "JOB");
        assert_eq!(ContextOwner::Step(id).kind(), "STEP");
        assert_eq!(ContextOwner::Step(id).id(), id);
    }
}
