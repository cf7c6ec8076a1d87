//! Append-only audit ledger.
//!
//! Every component records what it did here: cache hits, remote calls (by
//! content hash, never raw text), failures before any recovery, and stage
//! completions. The ledger is the lineage record; nothing in it is ever
//! rewritten or reordered.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::error::LlmError;
use crate::hash::hash_json;

/// One line of the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub data: Value,
    /// blake3 of `data`
    pub content_hash: String,
}

impl AuditEntry {
    fn new(session_id: &str, operation: &str, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            operation: operation.to_string(),
            content_hash: hash_json(&data),
            data,
        }
    }
}

/// Ledger port. Implementations only need to serialize individual appends.
pub trait AuditLedger: Send + Sync {
    fn session_id(&self) -> &str;

    fn append(&self, operation: &str, data: Value) -> Result<AuditEntry>;

    /// All entries in append order.
    fn entries(&self) -> Result<Vec<AuditEntry>>;

    /// Append, logging instead of propagating a ledger write failure.
    fn record(&self, operation: &str, data: Value) {
        if let Err(e) = self.append(operation, data) {
            error!(operation, error = %e, "Failed to append audit entry");
        }
    }

    /// Record a failure in the common `error` shape.
    fn record_error(&self, operation: &str, kind: &str, message: &str, context: Value) {
        self.record(
            "error",
            json!({
                "error_operation": operation,
                "error_type": kind,
                "error_message": message,
                "context": context,
            }),
        );
    }

    fn record_llm_error(&self, operation: &str, err: &LlmError, context: Value) {
        self.record_error(operation, err.kind(), &err.to_string(), context);
    }
}

/// Newline-delimited JSON file, one per session.
pub struct JsonlAuditLog {
    session_id: String,
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditLog {
    /// Open a new session ledger in `dir` and write `session_start`.
    pub fn open(dir: &Path, session_id: Option<String>) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create audit dir {:?}", dir))?;
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let path = dir.join(format!("audit_log_{}.jsonl", session_id));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open audit log {:?}", path))?;

        let log = Self {
            session_id,
            path,
            file: Mutex::new(file),
        };
        log.append(
            "session_start",
            json!({ "pid": std::process::id(), "crate_version": env!("CARGO_PKG_VERSION") }),
        )?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(&self) -> Result<()> {
        self.append("session_end", json!({}))?;
        Ok(())
    }

    /// Await `work`, then close the session whatever the outcome. A failed
    /// run is recorded before `session_end` and keeps its own error; a close
    /// failure is only returned when the run succeeded.
    pub async fn close_after<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        let outcome = work.await;
        if let Err(e) = &outcome {
            self.record_error("run", "run_failed", &format!("{:#}", e), json!({}));
        }
        match (outcome, self.close()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    error!(error = %close_err, "Failed to close audit ledger");
                }
                Err(e)
            }
        }
    }
}

impl AuditLedger for JsonlAuditLog {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn append(&self, operation: &str, data: Value) -> Result<AuditEntry> {
        let entry = AuditEntry::new(&self.session_id, operation, data);
        let mut line = serde_json::to_string(&entry).context("serialize audit entry")?;
        line.push('\n');

        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("audit log lock poisoned"))?;
        file.write_all(line.as_bytes())
            .context("Failed to write audit entry")?;
        file.flush()?;
        debug!(operation, entry_id = %entry.id, "audit entry appended");
        Ok(entry)
    }

    fn entries(&self) -> Result<Vec<AuditEntry>> {
        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open audit log {:?}", self.path))?;
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line).context("parse audit entry")?);
        }
        Ok(entries)
    }
}

/// In-memory ledger for tests.
pub struct MemoryAuditLog {
    session_id: String,
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Entries whose operation matches exactly.
    pub fn with_operation(&self, operation: &str) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|e| {
                e.iter()
                    .filter(|entry| entry.operation == operation)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `error` entries raised by one operation.
    pub fn errors_for(&self, error_operation: &str) -> Vec<AuditEntry> {
        self.with_operation("error")
            .into_iter()
            .filter(|e| e.data["error_operation"] == error_operation)
            .collect()
    }
}

impl Default for MemoryAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLedger for MemoryAuditLog {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn append(&self, operation: &str, data: Value) -> Result<AuditEntry> {
        let entry = AuditEntry::new(&self.session_id, operation, data);
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("audit log lock poisoned"))?
            .push(entry.clone());
        Ok(entry)
    }

    fn entries(&self) -> Result<Vec<AuditEntry>> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("audit log lock poisoned"))?
            .clone())
    }
}

/// Lineage summary derived by filtering the ledger on operation type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LineageReport {
    pub session_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub operations: usize,
    pub operation_counts: BTreeMap<String, usize>,
    pub llm_calls: Vec<LlmCallRecord>,
    pub cache_hits: usize,
    pub errors: Vec<ErrorRecord>,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCallRecord {
    pub model: String,
    pub timestamp: DateTime<Utc>,
    pub prompt_hash: String,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub operation: String,
    pub error_type: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LineageReport {
    pub fn from_entries(session_id: &str, entries: &[AuditEntry]) -> Self {
        let mut report = LineageReport {
            session_id: session_id.to_string(),
            start_time: entries.first().map(|e| e.timestamp),
            end_time: entries.last().map(|e| e.timestamp),
            operations: entries.len(),
            ..Default::default()
        };

        for entry in entries {
            *report
                .operation_counts
                .entry(entry.operation.clone())
                .or_default() += 1;

            match entry.operation.as_str() {
                "llm_call" => {
                    let total_tokens = entry.data["tokens_used"]["total"].as_u64();
                    report.total_tokens += total_tokens.unwrap_or(0);
                    report.llm_calls.push(LlmCallRecord {
                        model: entry.data["model"].as_str().unwrap_or_default().to_string(),
                        timestamp: entry.timestamp,
                        prompt_hash: entry.data["prompt_hash"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                        total_tokens,
                    });
                }
                op if op.ends_with("cache_hit") => report.cache_hits += 1,
                "error" => report.errors.push(ErrorRecord {
                    operation: entry.data["error_operation"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    error_type: entry.data["error_type"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    message: entry.data["error_message"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    timestamp: entry.timestamp,
                }),
                _ => {}
            }
        }

        report
    }

    pub fn from_ledger(ledger: &dyn AuditLedger) -> Result<Self> {
        Ok(Self::from_entries(ledger.session_id(), &ledger.entries()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonl_log_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlAuditLog::open(dir.path(), Some("s1".to_string())).unwrap();
        log.record("feature_cache_hit", json!({"cache_key": "k"}));
        log.record("llm_call", json!({"model": "m", "prompt_hash": "p"}));
        log.close().unwrap();

        assert!(dir.path().join("audit_log_s1.jsonl").exists());
        let entries = log.entries().unwrap();
        let ops: Vec<&str> = entries.iter().map(|e| e.operation.as_str()).collect();
        assert_eq!(
            ops,
            vec!["session_start", "feature_cache_hit", "llm_call", "session_end"]
        );
        assert!(entries.iter().all(|e| e.session_id == "s1"));
        assert_eq!(entries[1].content_hash, hash_json(&json!({"cache_key": "k"})));
    }

    #[tokio::test]
    async fn test_failed_run_still_ends_session() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlAuditLog::open(dir.path(), Some("s2".to_string())).unwrap();

        let outcome: Result<()> = log
            .close_after(async { Err(anyhow::anyhow!("report path unwritable")) })
            .await;

        assert_eq!(outcome.unwrap_err().to_string(), "report path unwritable");
        let entries = log.entries().unwrap();
        let ops: Vec<&str> = entries.iter().map(|e| e.operation.as_str()).collect();
        assert_eq!(ops, vec!["session_start", "error", "session_end"]);
        assert_eq!(entries[1].data["error_operation"], "run");
    }

    #[tokio::test]
    async fn test_successful_run_ends_session_once() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlAuditLog::open(dir.path(), None).unwrap();

        let value = log.close_after(async { Ok(7) }).await.unwrap();

        assert_eq!(value, 7);
        let report = LineageReport::from_ledger(&log).unwrap();
        assert_eq!(report.operation_counts["session_end"], 1);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_jsonl_lines_have_required_fields() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlAuditLog::open(dir.path(), None).unwrap();
        log.record("stage", json!({"n": 1}));

        let raw = std::fs::read_to_string(log.path()).unwrap();
        for line in raw.lines() {
            let v: Value = serde_json::from_str(line).unwrap();
            for field in ["id", "session_id", "timestamp", "operation", "data"] {
                assert!(v.get(field).is_some(), "missing {}", field);
            }
        }
    }

    #[test]
    fn test_lineage_report_groups_operations() {
        let log = MemoryAuditLog::new();
        log.record(
            "llm_call",
            json!({"model": "gpt", "prompt_hash": "h1", "tokens_used": {"total": 120}}),
        );
        log.record("llm_cache_hit", json!({"cache_key": "k"}));
        log.record("feature_cache_hit", json!({"cache_key": "k2"}));
        log.record_error("feature_extraction", "transport_error", "boom", json!({}));

        let report = LineageReport::from_ledger(&log).unwrap();
        assert_eq!(report.operations, 4);
        assert_eq!(report.llm_calls.len(), 1);
        assert_eq!(report.total_tokens, 120);
        assert_eq!(report.cache_hits, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].operation, "feature_extraction");
        assert_eq!(report.operation_counts["error"], 1);
    }
}
