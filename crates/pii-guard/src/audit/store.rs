//! Append-only persistence for audit entries.
//!
//! The core never exposes an update or delete operation on this store.
//! Consumers may read, but every write goes through [`AuditStore::append`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use common::{AuditAction, AuditLogEntry};

use super::AuditError;

/// Filter and pagination parameters for audit queries.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub actor_id: Option<String>,
    pub action: Option<AuditAction>,
    pub target_id: Option<String>,
    pub success: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Maximum entries returned; 100 when unset.
    pub limit: Option<usize>,
    /// Entries to skip before collecting, for pagination.
    pub skip: usize,
}

impl AuditQuery {
    pub(crate) fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.actor_id
            .as_deref()
            .map_or(true, |a| entry.actor_id == a)
            && self.action.map_or(true, |a| entry.action == a)
            && self
                .target_id
                .as_deref()
                .map_or(true, |t| entry.target_id.as_deref() == Some(t))
            && self.success.map_or(true, |s| entry.success == s)
            && self.from.map_or(true, |f| entry.timestamp >= f)
            && self.to.map_or(true, |t| entry.timestamp <= t)
    }
}

/// Backing store capability for the audit chain.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append one entry. Must not reorder or drop entries.
    async fn append(&self, entry: AuditLogEntry) -> Result<(), AuditError>;

    /// Most recently appended entry, if any. Used to reseed the chain head
    /// on startup.
    async fn last(&self) -> Result<Option<AuditLogEntry>, AuditError>;

    /// All entries in append order, oldest first, capped at `limit`.
    async fn scan_chronological(&self, limit: usize) -> Result<Vec<AuditLogEntry>, AuditError>;

    /// Filtered, paginated read, newest first.
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>, AuditError>;
}

/// In-process store over a `Vec`. Suitable for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryAuditStore {
    pub(crate) entries: RwLock<Vec<AuditLogEntry>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, entry: AuditLogEntry) -> Result<(), AuditError> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn last(&self) -> Result<Option<AuditLogEntry>, AuditError> {
        Ok(self.entries.read().await.last().cloned())
    }

    async fn scan_chronological(&self, limit: usize) -> Result<Vec<AuditLogEntry>, AuditError> {
        Ok(self.entries.read().await.iter().take(limit).cloned().collect())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>, AuditError> {
        let limit = query.limit.unwrap_or(100);
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .rev()
            .filter(|e| query.matches(e))
            .skip(query.skip)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// JSONL file store, one entry per line, append-only.
///
/// Reads parse the whole file; acceptable for the sizes an audit file
/// reaches between rotations of the file itself.
pub struct FileAuditStore {
    path: PathBuf,
    /// Writers take the write half; readers share the read half. The file
    /// itself is only ever opened in append mode for writes.
    lock: RwLock<()>,
}

impl FileAuditStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: RwLock::new(()),
        }
    }

    async fn read_all(&self) -> Result<Vec<AuditLogEntry>, AuditError> {
        let _guard = self.lock.read().await;
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AuditError::Store(e.to_string())),
        };
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(|e| AuditError::Store(e.to_string())))
            .collect()
    }
}

#[async_trait]
impl AuditStore for FileAuditStore {
    async fn append(&self, entry: AuditLogEntry) -> Result<(), AuditError> {
        let mut line =
            serde_json::to_string(&entry).map_err(|e| AuditError::Store(e.to_string()))?;
        line.push('\n');

        let _guard = self.lock.write().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| AuditError::Store(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| AuditError::Store(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| AuditError::Store(e.to_string()))?;
        Ok(())
    }

    async fn last(&self) -> Result<Option<AuditLogEntry>, AuditError> {
        Ok(self.read_all().await?.pop())
    }

    async fn scan_chronological(&self, limit: usize) -> Result<Vec<AuditLogEntry>, AuditError> {
        let mut entries = self.read_all().await?;
        entries.truncate(limit);
        Ok(entries)
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>, AuditError> {
        let limit = query.limit.unwrap_or(100);
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .rev()
            .filter(|e| query.matches(e))
            .skip(query.skip)
            .take(limit)
            .collect())
    }
}
