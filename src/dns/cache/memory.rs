use super::{CacheStore, CachedRecord};
use crate::base::neterror::NetError;
use std::collections::{HashMap, VecDeque};

/// In-process cache storage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    lookups: HashMap<String, Vec<CachedRecord>>,
    order: VecDeque<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn unlink(&mut self, hostname: &str) {
        if let Some(pos) = self.order.iter().position(|h| h == hostname) {
            self.order.remove(pos);
        }
    }
}

impl CacheStore for MemoryStore {
    fn get(&mut self, hostname: &str) -> Result<Option<Vec<CachedRecord>>, NetError> {
        Ok(self.lookups.get(hostname).cloned())
    }

    fn insert(&mut self, hostname: &str, records: Vec<CachedRecord>) -> Result<(), NetError> {
        if self.lookups.insert(hostname.to_string(), records).is_some() {
            self.unlink(hostname);
        }
        self.order.push_back(hostname.to_string());
        Ok(())
    }

    fn update(&mut self, hostname: &str, records: Vec<CachedRecord>) -> Result<(), NetError> {
        if let Some(existing) = self.lookups.get_mut(hostname) {
            *existing = records;
        }
        Ok(())
    }

    fn remove(&mut self, hostname: &str) -> Result<bool, NetError> {
        let removed = self.lookups.remove(hostname).is_some();
        if removed {
            self.unlink(hostname);
        }
        Ok(removed)
    }

    fn oldest(&mut self) -> Result<Option<String>, NetError> {
        Ok(self.order.front().cloned())
    }

    fn hostnames(&mut self) -> Result<Vec<String>, NetError> {
        Ok(self.order.iter().cloned().collect())
    }

    fn len(&mut self) -> Result<usize, NetError> {
        Ok(self.lookups.len())
    }

    fn clear(&mut self) -> Result<(), NetError> {
        self.lookups.clear();
        self.order.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::cache::CachedData;
    use std::net::{IpAddr, Ipv4Addr};
    use time::OffsetDateTime;

    fn record(name: &str) -> CachedRecord {
        CachedRecord {
            name: name.to_string(),
            data: CachedData::Address(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            expires_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_insertion_order() {
        let mut store = MemoryStore::new();
        store.insert("a", vec![record("a")]).unwrap();
        store.insert("b", vec![record("b")]).unwrap();
        store.insert("a", vec![record("a")]).unwrap();

        assert_eq!(store.oldest().unwrap().as_deref(), Some("b"));
        assert_eq!(store.hostnames().unwrap(), vec!["b", "a"]);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_update_keeps_position() {
        let mut store = MemoryStore::new();
        store.insert("a", vec![record("a")]).unwrap();
        store.insert("b", vec![record("b")]).unwrap();
        store.update("a", vec![]).unwrap();
        store.update("missing", vec![record("missing")]).unwrap();

        assert_eq!(store.hostnames().unwrap(), vec!["a", "b"]);
        assert_eq!(store.get("a").unwrap(), Some(vec![]));
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_remove() {
        let mut store = MemoryStore::new();
        store.insert("a", vec![record("a")]).unwrap();

        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert!(store.oldest().unwrap().is_none());
    }
}
