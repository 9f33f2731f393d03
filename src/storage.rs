use crate::{error::Error, lease::FencingToken, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

/// One object as reported by `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

/// The narrow surface the coordinator's callers use to reach the object
/// store, with fencing enforced on the write path.
///
/// `put` must reject any write tagged with a token lower than the highest it
/// has already accepted for that key; that is what makes a reclaimed holder
/// harmless. The coordinator only issues tokens; it never performs the
/// guarded writes itself.
#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    async fn put(&self, key: &str, data: Bytes, token: FencingToken) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;
}

/// Reference in-memory object store used by tests to demonstrate
/// stale-writer rejection.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, (FencingToken, Bytes)>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Bytes, token: FencingToken) -> Result<()> {
        let mut entry = self
            .objects
            .entry(key.to_string())
            .or_insert_with(|| (FencingToken::default(), Bytes::new()));
        let highest = entry.0;
        if token < highest {
            debug!("rejected stale write to {key} (token {token}, highest {highest})");
            return Err(Error::Conflict {
                resource: key.to_string(),
            });
        }
        *entry = (token, data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.objects.get(key).map(|entry| entry.value().1.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects: Vec<ObjectInfo> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| ObjectInfo {
                key: entry.key().clone(),
                size: entry.value().1.len() as u64,
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::block_on;

    #[test]
    fn fencing_rejects_stale_writer() {
        let store = MemoryObjectStore::new();

        block_on(store.put("reportX", Bytes::from_static(b"v1"), FencingToken(1))).unwrap();
        block_on(store.put("reportX", Bytes::from_static(b"v2"), FencingToken(2))).unwrap();

        // The old holder's token must never be honored again.
        let err =
            block_on(store.put("reportX", Bytes::from_static(b"stale"), FencingToken(1)))
                .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        let data = block_on(store.get("reportX")).unwrap().unwrap();
        assert_eq!(&data[..], b"v2");
    }

    #[test]
    fn holder_may_rewrite_with_its_own_token() {
        let store = MemoryObjectStore::new();
        block_on(store.put("a", Bytes::from_static(b"x"), FencingToken(3))).unwrap();
        block_on(store.put("a", Bytes::from_static(b"y"), FencingToken(3))).unwrap();
        let data = block_on(store.get("a")).unwrap().unwrap();
        assert_eq!(&data[..], b"y");
    }

    #[test]
    fn list_reports_keys_and_sizes() {
        let store = MemoryObjectStore::new();
        block_on(store.put("data/a", Bytes::from_static(b"aa"), FencingToken(1))).unwrap();
        block_on(store.put("data/b", Bytes::from_static(b"bbb"), FencingToken(1))).unwrap();
        block_on(store.put("logs/c", Bytes::from_static(b"c"), FencingToken(1))).unwrap();

        let listed = block_on(store.list("data/")).unwrap();
        assert_eq!(
            listed,
            vec![
                ObjectInfo {
                    key: "data/a".to_string(),
                    size: 2
                },
                ObjectInfo {
                    key: "data/b".to_string(),
                    size: 3
                },
            ]
        );
    }
}
