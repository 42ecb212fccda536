//! Pool registration and heartbeat snapshots.
//!
//! A manager registers itself on start, refreshes its registration on every
//! heartbeat with a snapshot of the whole pool, and deregisters on clean
//! shutdown. Registrations carry a TTL so a crashed manager ages out of the
//! registry instead of lingering forever.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::handle::ProcessState;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry serialization error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Execution in flight on a busy worker, as reported in heartbeats
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentExecution {
    pub execution_id: String,
    pub elapsed_ms: u64,
}

/// One worker's slice of a heartbeat snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub process_id: String,
    pub pid: Option<u32>,
    pub state: ProcessState,
    pub memory_mb: Option<u64>,
    pub uptime_seconds: u64,
    pub executions_completed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_execution: Option<CurrentExecution>,
}

/// Full pool state published on every heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub pool_id: String,
    pub timestamp: DateTime<Utc>,
    pub pool_size: usize,
    pub idle_count: usize,
    pub busy_count: usize,
    pub workers: Vec<WorkerSnapshot>,
}

#[async_trait]
pub trait PoolRegistry: Send + Sync {
    /// Announce a new pool. Idempotent; re-registering refreshes the TTL.
    async fn register(&self, pool_id: &str, ttl: Duration) -> Result<(), RegistryError>;

    /// Heartbeat: publish the current snapshot and extend the TTL
    async fn refresh(&self, snapshot: &PoolSnapshot, ttl: Duration) -> Result<(), RegistryError>;

    /// Remove the pool's registration on clean shutdown
    async fn deregister(&self, pool_id: &str) -> Result<(), RegistryError>;
}

/// In-process registry for tests and embedded use
#[derive(Default)]
pub struct InMemoryRegistry {
    entries: Mutex<HashMap<String, PoolSnapshot>>,
    refresh_count: AtomicU64,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self, pool_id: &str) -> Option<PoolSnapshot> {
        self.entries.lock().await.get(pool_id).cloned()
    }

    pub async fn is_registered(&self, pool_id: &str) -> bool {
        self.entries.lock().await.contains_key(pool_id)
    }
}

#[async_trait]
impl PoolRegistry for InMemoryRegistry {
    async fn register(&self, pool_id: &str, _ttl: Duration) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock().await;
        entries.entry(pool_id.to_string()).or_insert_with(|| PoolSnapshot {
            pool_id: pool_id.to_string(),
            timestamp: Utc::now(),
            pool_size: 0,
            idle_count: 0,
            busy_count: 0,
            workers: Vec::new(),
        });
        Ok(())
    }

    async fn refresh(&self, snapshot: &PoolSnapshot, _ttl: Duration) -> Result<(), RegistryError> {
        self.entries
            .lock()
            .await
            .insert(snapshot.pool_id.clone(), snapshot.clone());
        self.refresh_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn deregister(&self, pool_id: &str) -> Result<(), RegistryError> {
        self.entries.lock().await.remove(pool_id);
        Ok(())
    }
}

/// On-disk record written by [`FsRegistry`]. `expires_at` lets readers
/// filter out registrations from managers that died without deregistering.
#[derive(Debug, Serialize, Deserialize)]
struct RegistryRecord {
    expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot: Option<PoolSnapshot>,
}

/// Filesystem registry: one JSON file per pool under a shared directory
pub struct FsRegistry {
    dir: PathBuf,
}

impl FsRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, pool_id: &str) -> PathBuf {
        let safe: String = pool_id
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    async fn write_record(&self, pool_id: &str, record: &RegistryRecord) -> Result<(), RegistryError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(self.record_path(pool_id), body).await?;
        Ok(())
    }
}

#[async_trait]
impl PoolRegistry for FsRegistry {
    async fn register(&self, pool_id: &str, ttl: Duration) -> Result<(), RegistryError> {
        let record = RegistryRecord {
            expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30)),
            snapshot: None,
        };
        self.write_record(pool_id, &record).await
    }

    async fn refresh(&self, snapshot: &PoolSnapshot, ttl: Duration) -> Result<(), RegistryError> {
        let record = RegistryRecord {
            expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30)),
            snapshot: Some(snapshot.clone()),
        };
        self.write_record(&snapshot.pool_id, &record).await
    }

    async fn deregister(&self, pool_id: &str) -> Result<(), RegistryError> {
        match tokio::fs::remove_file(self.record_path(pool_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pool_id: &str) -> PoolSnapshot {
        PoolSnapshot {
            pool_id: pool_id.to_string(),
            timestamp: Utc::now(),
            pool_size: 2,
            idle_count: 1,
            busy_count: 1,
            workers: vec![WorkerSnapshot {
                process_id: "worker-0".to_string(),
                pid: Some(100),
                state: ProcessState::Busy,
                memory_mb: Some(48),
                uptime_seconds: 5,
                executions_completed: 3,
                current_execution: Some(CurrentExecution {
                    execution_id: "e1".to_string(),
                    elapsed_ms: 1200,
                }),
            }],
        }
    }

    #[tokio::test]
    async fn test_in_memory_register_refresh_deregister() {
        let registry = InMemoryRegistry::new();
        registry.register("pool-a", Duration::from_secs(30)).await.unwrap();
        assert!(registry.is_registered("pool-a").await);

        registry
            .refresh(&snapshot("pool-a"), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(registry.refresh_count(), 1);
        let stored = registry.snapshot("pool-a").await.unwrap();
        assert_eq!(stored.pool_size, 2);
        assert_eq!(stored.busy_count, 1);

        registry.deregister("pool-a").await.unwrap();
        assert!(!registry.is_registered("pool-a").await);
    }

    #[tokio::test]
    async fn test_fs_registry_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FsRegistry::new(dir.path());

        registry.register("pool-b", Duration::from_secs(30)).await.unwrap();
        assert!(dir.path().join("pool-b.json").exists());

        registry
            .refresh(&snapshot("pool-b"), Duration::from_secs(30))
            .await
            .unwrap();
        let body = tokio::fs::read_to_string(dir.path().join("pool-b.json"))
            .await
            .unwrap();
        let record: RegistryRecord = serde_json::from_str(&body).unwrap();
        let stored = record.snapshot.unwrap();
        assert_eq!(stored.workers.len(), 1);
        assert_eq!(stored.workers[0].state, ProcessState::Busy);

        registry.deregister("pool-b").await.unwrap();
        assert!(!dir.path().join("pool-b.json").exists());
        // double deregister is fine
        registry.deregister("pool-b").await.unwrap();
    }
}
