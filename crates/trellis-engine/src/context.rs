use crate::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

pub type RuntimeContext = BTreeMap<String, Value>;

const MAX_KEY_LENGTH: usize = 256;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub values: RuntimeContext,
}

/// Mutable key-value execution state, exclusively owned by one runner
/// at a time. Branches get `clone_isolated` copies and never share a
/// live store.
#[derive(Clone, Default)]
pub struct ContextStore {
    inner: Arc<RwLock<RuntimeContext>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: RuntimeContext) -> Self {
        Self {
            inner: Arc::new(RwLock::new(values)),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: Value) -> Result<(), EngineError> {
        let key = key.into();
        validate_context_key(&key)?;
        let mut values = self
            .inner
            .write()
            .map_err(|_| EngineError::Runtime("context write lock poisoned".to_string()))?;
        values.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, EngineError> {
        let values = self
            .inner
            .read()
            .map_err(|_| EngineError::Runtime("context read lock poisoned".to_string()))?;
        Ok(values.get(key).cloned())
    }

    pub fn remove(&self, key: &str) -> Result<(), EngineError> {
        let mut values = self
            .inner
            .write()
            .map_err(|_| EngineError::Runtime("context write lock poisoned".to_string()))?;
        values.remove(key);
        Ok(())
    }

    pub fn apply_updates(&self, updates: &RuntimeContext) -> Result<(), EngineError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut values = self
            .inner
            .write()
            .map_err(|_| EngineError::Runtime("context write lock poisoned".to_string()))?;
        for (key, value) in updates {
            validate_context_key(key)?;
            values.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Result<ContextSnapshot, EngineError> {
        let values = self
            .inner
            .read()
            .map_err(|_| EngineError::Runtime("context read lock poisoned".to_string()))?;
        Ok(ContextSnapshot {
            values: values.clone(),
        })
    }

    pub fn clone_isolated(&self) -> Result<Self, EngineError> {
        Ok(Self::from_values(self.snapshot()?.values))
    }
}

pub fn validate_context_key(key: &str) -> Result<(), EngineError> {
    if key.is_empty() {
        return Err(EngineError::Runtime(
            "context key cannot be empty".to_string(),
        ));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(EngineError::Runtime(format!(
            "context key '{}' exceeds max length {}",
            key, MAX_KEY_LENGTH
        )));
    }

    for segment in key.split('.') {
        validate_key_segment(segment, key)?;
    }
    Ok(())
}

fn validate_key_segment(segment: &str, full_key: &str) -> Result<(), EngineError> {
    let mut chars = segment.chars();
    let Some(first) = chars.next() else {
        return Err(EngineError::Runtime(format!(
            "context key '{}' contains an empty namespace segment",
            full_key
        )));
    };
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(EngineError::Runtime(format!(
            "context key '{}' has invalid segment '{}'",
            full_key, segment
        )));
    }
    if chars.any(|c| !(c.is_ascii_alphanumeric() || c == '_' || c == '-')) {
        return Err(EngineError::Runtime(format!(
            "context key '{}' has invalid segment '{}'",
            full_key, segment
        )));
    }
    Ok(())
}
