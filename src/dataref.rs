use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::partition::DataShape;

/// A registered on-disk dataset. Jobs carry the reference id instead of the
/// payload; nodes resolve it to a path on shared storage.
#[derive(Debug, Clone, Serialize)]
pub struct DataReference {
    pub id: Uuid,
    pub path: PathBuf,
    pub shared_path: Option<PathBuf>,
    pub data_type: String,
    pub dims: DataShape,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ref_count: u32,
}

/// Registry of large binary artifacts, keyed by an identity derived from
/// `(path, size, mtime)`. Registering the same unchanged file twice returns
/// the same reference instead of duplicating storage.
#[derive(Debug)]
pub struct DataReferenceStore {
    refs: RwLock<HashMap<Uuid, DataReference>>,
    shared_dir: PathBuf,
    ttl: Duration,
}

impl DataReferenceStore {
    pub fn new(shared_dir: PathBuf, ttl: Duration) -> Self {
        Self {
            refs: RwLock::new(HashMap::new()),
            shared_dir,
            ttl,
        }
    }

    /// Stable identity for a file at a point in time. Content hashing is
    /// impractical for multi-terabyte volumes, so the identity covers the
    /// canonical path plus size and mtime; a rewritten file becomes a new
    /// reference.
    fn reference_id(path: &Path, size: u64, mtime_secs: u64) -> Uuid {
        let name = format!("{}:{}:{}", path.display(), size, mtime_secs);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }

    /// Register a dataset, optionally copying it into shared storage so all
    /// nodes can reach it. Idempotent for an unchanged `(path, size, mtime)`
    /// tuple.
    pub async fn register(
        &self,
        path: &Path,
        data_type: &str,
        dims: DataShape,
        copy_to_shared: bool,
    ) -> Result<DataReference> {
        let canonical = tokio::fs::canonicalize(path).await?;
        let meta = tokio::fs::metadata(&canonical).await?;
        let mtime_secs = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let id = Self::reference_id(&canonical, meta.len(), mtime_secs);

        {
            let refs = self.refs.read().await;
            if let Some(existing) = refs.get(&id) {
                if existing.shared_path.is_some() || !copy_to_shared {
                    return Ok(existing.clone());
                }
                // Fall through: the shared copy was requested this time.
            }
        }

        let shared_path = if copy_to_shared {
            Some(self.copy_to_shared(&canonical, id).await?)
        } else {
            None
        };

        let mut refs = self.refs.write().await;
        let entry = refs.entry(id).or_insert_with(|| DataReference {
            id,
            path: canonical.clone(),
            shared_path: None,
            data_type: data_type.to_string(),
            dims,
            created_at: Utc::now(),
            expires_at: Utc::now() + self.ttl,
            ref_count: 0,
        });
        if entry.shared_path.is_none() {
            entry.shared_path = shared_path;
        }
        tracing::info!(
            reference_id = %id,
            path = %canonical.display(),
            shared = entry.shared_path.is_some(),
            "Data reference registered"
        );
        Ok(entry.clone())
    }

    async fn copy_to_shared(&self, source: &Path, id: Uuid) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.shared_dir).await?;
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "dataset".to_string());
        let target = self.shared_dir.join(format!("{id}-{file_name}"));
        if tokio::fs::try_exists(&target).await? {
            return Ok(target);
        }
        // Hard link when shared storage sits on the same filesystem; fall
        // back to a full copy across mounts.
        if tokio::fs::hard_link(source, &target).await.is_err() {
            tokio::fs::copy(source, &target).await?;
        }
        Ok(target)
    }

    /// Resolve a reference to the path nodes should read, preferring the
    /// shared-storage copy.
    pub async fn resolve(&self, id: Uuid) -> Result<PathBuf> {
        let refs = self.refs.read().await;
        let reference = refs
            .get(&id)
            .ok_or(OrchestratorError::DataRefNotFound(id))?;
        Ok(reference
            .shared_path
            .clone()
            .unwrap_or_else(|| reference.path.clone()))
    }

    pub async fn get(&self, id: Uuid) -> Option<DataReference> {
        self.refs.read().await.get(&id).cloned()
    }

    /// Record one more job holding this reference.
    pub async fn retain(&self, id: Uuid) -> Result<()> {
        let mut refs = self.refs.write().await;
        let reference = refs
            .get_mut(&id)
            .ok_or(OrchestratorError::DataRefNotFound(id))?;
        reference.ref_count += 1;
        Ok(())
    }

    /// Drop one job's hold. Unknown ids are ignored: the reference may have
    /// been swept while its last jobs aged out.
    pub async fn release(&self, id: Uuid) {
        let mut refs = self.refs.write().await;
        if let Some(reference) = refs.get_mut(&id) {
            reference.ref_count = reference.ref_count.saturating_sub(1);
        }
    }

    /// Delete expired references that no job holds. Entries are collected
    /// under the lock, removed, and their shared copies deleted afterwards so
    /// no lock is held during I/O. Returns the number of references removed.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let removed: Vec<DataReference> = {
            let mut refs = self.refs.write().await;
            let expired: Vec<Uuid> = refs
                .values()
                .filter(|r| r.expires_at <= now && r.ref_count == 0)
                .map(|r| r.id)
                .collect();
            expired.iter().filter_map(|id| refs.remove(id)).collect()
        };

        for reference in &removed {
            if let Some(shared) = &reference.shared_path {
                if let Err(e) = tokio::fs::remove_file(shared).await {
                    tracing::warn!(
                        reference_id = %reference.id,
                        path = %shared.display(),
                        error = %e,
                        "Failed to remove shared copy"
                    );
                }
            }
            tracing::debug!(reference_id = %reference.id, "Data reference expired");
        }
        removed.len()
    }

    pub async fn len(&self) -> usize {
        self.refs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.refs.read().await.is_empty()
    }
}
