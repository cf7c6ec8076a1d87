//! Content-addressed cache store.
//!
//! Records are self-describing JSON envelopes. Namespaces are slash-separated
//! and map onto directories for the file-backed store, so the feature cache
//! can be partitioned per question (`features/<question_id>`) while the
//! client-level request cache stays flat (`llm`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::audit::AuditLedger;

// Namespaces
pub const LLM_NAMESPACE: &str = "llm";
pub const QUESTION_NAMESPACE: &str = "questions";
pub const SYNTHESIS_NAMESPACE: &str = "synthesis";
pub const PROGRAM_NAMESPACE: &str = "programs";

pub fn feature_namespace(question_id: &str) -> String {
    format!("features/{}", sanitize_segment(question_id))
}

/// Keep namespace segments and keys filesystem-safe.
fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Key-value port used by every cached stage.
///
/// Reads and writes are synchronous; a lookup always happens before any
/// remote call is made. Two writers racing on one key is harmless because
/// the payload is a pure function of the key.
pub trait CacheStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>>;
    fn put(&self, namespace: &str, key: &str, value: &Value) -> Result<()>;
}

/// Envelope stored around every cached payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord<T> {
    pub cache_key: String,
    pub cached_at: DateTime<Utc>,
    pub model: String,
    pub schema_version: String,
    pub payload: T,
}

impl<T: Serialize + DeserializeOwned> CacheRecord<T> {
    pub fn new(cache_key: &str, model: &str, schema_version: &str, payload: T) -> Self {
        Self {
            cache_key: cache_key.to_string(),
            cached_at: Utc::now(),
            model: model.to_string(),
            schema_version: schema_version.to_string(),
            payload,
        }
    }

    /// Load and decode a record. A record that cannot be read or decoded is
    /// audited under `invalid_operation` and reported as a miss; the caller
    /// re-derives it.
    pub fn load(
        store: &dyn CacheStore,
        audit: &dyn AuditLedger,
        invalid_operation: &str,
        namespace: &str,
        key: &str,
    ) -> Option<Self> {
        let reason = match store.get(namespace, key) {
            Ok(None) => return None,
            Ok(Some(value)) => match serde_json::from_value::<Self>(value) {
                Ok(record) => return Some(record),
                Err(e) => format!("record does not decode: {}", e),
            },
            Err(e) => format!("read failed: {:#}", e),
        };
        warn!(namespace, key, reason = %reason, "Cache record unusable, treating as miss");
        audit.record(
            invalid_operation,
            json!({ "namespace": namespace, "cache_key": key, "reason": reason }),
        );
        None
    }

    pub fn store(&self, store: &dyn CacheStore, namespace: &str) -> Result<()> {
        let value = serde_json::to_value(self).context("serialize cache record")?;
        store.put(namespace, &self.cache_key, &value)
    }
}

/// JSON files under a root directory: `<root>/<namespace>/<key>.json`.
pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create cache dir {:?}", root))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path_for(&self, namespace: &str, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in namespace.split('/').filter(|s| !s.is_empty()) {
            path.push(sanitize_segment(segment));
        }
        path.push(format!("{}.json", sanitize_segment(key)));
        path
    }
}

impl CacheStore for FileCache {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(namespace, key);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path).with_context(|| format!("read {:?}", path))?;
        let value = serde_json::from_slice(&bytes)
            .with_context(|| format!("corrupt cache file {:?}", path))?;
        Ok(Some(value))
    }

    fn put(&self, namespace: &str, key: &str, value: &Value) -> Result<()> {
        let path = self.path_for(namespace, key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write then rename so a reader never sees a half-written record.
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(value).context("serialize cache value")?;
        std::fs::write(&tmp, bytes).with_context(|| format!("write {:?}", tmp))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("rename into {:?}", path))?;
        debug!(namespace, key, "cache record written");
        Ok(())
    }
}

/// In-process store for tests and dry runs.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<(String, String), Value>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys stored under one namespace.
    pub fn keys(&self, namespace: &str) -> Vec<String> {
        let Ok(entries) = self.entries.read() else {
            return vec![];
        };
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow::anyhow!("memory cache lock poisoned"))?;
        Ok(entries
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn put(&self, namespace: &str, key: &str, value: &Value) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("memory cache lock poisoned"))?;
        entries.insert((namespace.to_string(), key.to_string()), value.clone());
        Ok(())
    }
}
