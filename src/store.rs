use crate::{
    error::Error,
    lease::{FencingToken, Lease, LockMode, ResourceId},
    time::Timestamp,
    Result, SessionId,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

/// Everything the store remembers about one resource.
///
/// The token counter outlives its leases: it is retained after every release
/// and reclamation so tokens never reuse across a resource's history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub leases: Vec<Lease>,
    pub last_token: FencingToken,
    pub version: u64,
}

impl ResourceRecord {
    /// Mode of the currently active holder set, if any.
    pub fn active_mode(&self) -> Option<LockMode> {
        self.leases.first().map(|lease| lease.mode)
    }

    /// Whether a new grant of `mode` may coexist with the active holders.
    pub fn accepts(&self, mode: LockMode) -> bool {
        self.leases
            .iter()
            .all(|lease| lease.mode.is_compatible(mode))
    }

    /// Drop every lease past its expiry, returning them.
    pub fn strip_expired(&mut self, now: Timestamp) -> Vec<Lease> {
        let mut expired = Vec::new();
        self.leases.retain(|lease| {
            if lease.is_expired(now) {
                expired.push(lease.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Remove the holder matching `lease`, if still present.
    pub fn remove_lease(&mut self, lease: &Lease) -> Option<Lease> {
        let idx = self
            .leases
            .iter()
            .position(|held| held.holder == lease.holder && held.token == lease.token)?;
        Some(self.leases.remove(idx))
    }

    /// Remove every lease held by `session`, returning them.
    pub fn remove_session(&mut self, session: SessionId) -> Vec<Lease> {
        let mut removed = Vec::new();
        self.leases.retain(|lease| {
            if lease.holder == session {
                removed.push(lease.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Grant a new lease with a freshly minted token.
    pub fn mint(
        &mut self,
        resource: &ResourceId,
        session: SessionId,
        mode: LockMode,
        expires_at: Timestamp,
    ) -> Lease {
        self.last_token = self.last_token.next();
        let lease = Lease {
            resource: resource.clone(),
            holder: session,
            mode,
            token: self.last_token,
            expires_at,
        };
        self.leases.push(lease.clone());
        lease
    }
}

/// Durable record of resource → lease state, the single source of truth.
///
/// `put` and `delete` are compare-and-swap against the version last read;
/// a lost race surfaces as [`Error::Conflict`] and the caller re-reads and
/// retries. An unreachable backing store surfaces as [`Error::Unavailable`];
/// callers retry with backoff and never assume the write landed.
#[async_trait]
pub trait LeaseStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, resource: &ResourceId) -> Result<Option<ResourceRecord>>;

    /// Store `record` if the resource is still at `expected` version
    /// (0 for a resource never written).
    async fn put(&self, resource: &ResourceId, record: ResourceRecord, expected: u64)
        -> Result<()>;

    /// Clear the holder set but keep the token counter.
    async fn delete(&self, resource: &ResourceId, expected: u64) -> Result<()>;

    async fn scan(&self) -> Result<Vec<(ResourceId, ResourceRecord)>>;
}

/// In-memory lease store. Not durable; used for tests and single-process
/// deployments where crash recovery is not needed.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    records: DashMap<ResourceId, ResourceRecord>,
    unavailable: AtomicBool,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: make every operation fail with `Unavailable`.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("memory store marked down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get(&self, resource: &ResourceId) -> Result<Option<ResourceRecord>> {
        self.check_reachable()?;
        Ok(self.records.get(resource).map(|r| r.clone()))
    }

    async fn put(
        &self,
        resource: &ResourceId,
        mut record: ResourceRecord,
        expected: u64,
    ) -> Result<()> {
        self.check_reachable()?;
        let mut entry = self.records.entry(resource.clone()).or_default();
        if entry.version != expected {
            return Err(Error::Conflict {
                resource: resource.to_string(),
            });
        }
        record.version = expected + 1;
        *entry = record;
        Ok(())
    }

    async fn delete(&self, resource: &ResourceId, expected: u64) -> Result<()> {
        self.check_reachable()?;
        let mut entry = self.records.entry(resource.clone()).or_default();
        if entry.version != expected {
            return Err(Error::Conflict {
                resource: resource.to_string(),
            });
        }
        entry.leases.clear();
        entry.version = expected + 1;
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<(ResourceId, ResourceRecord)>> {
        self.check_reachable()?;
        Ok(self
            .records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }
}

/// File-backed lease store: one bincode snapshot, rewritten atomically on
/// every mutation. Token counters survive process restarts.
#[derive(Debug)]
pub struct FileLeaseStore {
    path: PathBuf,
    records: Mutex<HashMap<ResourceId, ResourceRecord>>,
}

impl FileLeaseStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match fs::read(&path) {
            Ok(bytes) => bincode::deserialize(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    fn persist(&self, records: &HashMap<ResourceId, ResourceRecord>) -> Result<()> {
        let bytes = bincode::serialize(records)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|e| unavailable(&tmp, &e))?;
        fs::rename(&tmp, &self.path).map_err(|e| unavailable(&self.path, &e))?;
        Ok(())
    }
}

fn unavailable(path: &Path, e: &std::io::Error) -> Error {
    Error::Unavailable(format!("{}: {e}", path.display()))
}

#[async_trait]
impl LeaseStore for FileLeaseStore {
    async fn get(&self, resource: &ResourceId) -> Result<Option<ResourceRecord>> {
        Ok(self.records.lock().get(resource).cloned())
    }

    async fn put(
        &self,
        resource: &ResourceId,
        mut record: ResourceRecord,
        expected: u64,
    ) -> Result<()> {
        let mut records = self.records.lock();
        let current = records.get(resource).map_or(0, |r| r.version);
        if current != expected {
            return Err(Error::Conflict {
                resource: resource.to_string(),
            });
        }
        record.version = expected + 1;
        records.insert(resource.clone(), record);
        self.persist(&records)
    }

    async fn delete(&self, resource: &ResourceId, expected: u64) -> Result<()> {
        let mut records = self.records.lock();
        let entry = records.entry(resource.clone()).or_default();
        if entry.version != expected {
            return Err(Error::Conflict {
                resource: resource.to_string(),
            });
        }
        entry.leases.clear();
        entry.version = expected + 1;
        self.persist(&records)
    }

    async fn scan(&self) -> Result<Vec<(ResourceId, ResourceRecord)>> {
        Ok(self
            .records
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
