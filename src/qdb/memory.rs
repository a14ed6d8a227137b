//! In-process key-value store
//!
//! Used by the `memory` backend and by tests. Domains can be marked
//! unreachable to simulate a relay whose store is gone.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::KvChannel;
use crate::error::ChannelError;

#[derive(Debug, Default)]
pub struct MemoryQubesDb {
    entries: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    unreachable: Mutex<HashSet<String>>,
}

impl MemoryQubesDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous peek, bypassing reachability
    pub fn get(&self, domain: &str, path: &str) -> Option<Vec<u8>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(&(domain.to_string(), path.to_string())).cloned()
    }

    /// Synchronous store, bypassing reachability
    pub fn set(&self, domain: &str, path: &str, value: &[u8]) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert((domain.to_string(), path.to_string()), value.to_vec());
    }

    pub fn set_unreachable(&self, domain: &str, unreachable: bool) {
        let mut set = self.unreachable.lock().unwrap_or_else(|e| e.into_inner());
        if unreachable {
            set.insert(domain.to_string());
        } else {
            set.remove(domain);
        }
    }

    fn check(&self, domain: &str) -> Result<(), ChannelError> {
        let set = self.unreachable.lock().unwrap_or_else(|e| e.into_inner());
        if set.contains(domain) {
            return Err(ChannelError::Unavailable {
                domain: domain.to_string(),
                reason: "marked unreachable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl KvChannel for MemoryQubesDb {
    async fn read(&self, domain: &str, path: &str) -> Result<Option<Vec<u8>>, ChannelError> {
        self.check(domain)?;
        Ok(self.get(domain, path))
    }

    async fn write(&self, domain: &str, path: &str, value: &[u8]) -> Result<(), ChannelError> {
        self.check(domain)?;
        self.set(domain, path, value);
        Ok(())
    }

    async fn rm(&self, domain: &str, path: &str) -> Result<(), ChannelError> {
        self.check(domain)?;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(&(domain.to_string(), path.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_write_rm() {
        let db = MemoryQubesDb::new();
        assert_eq!(db.read("sys-audio", "/a").await.unwrap(), None);
        db.write("sys-audio", "/a", b"1").await.unwrap();
        assert_eq!(db.read("sys-audio", "/a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.read("dom0", "/a").await.unwrap(), None);
        db.rm("sys-audio", "/a").await.unwrap();
        db.rm("sys-audio", "/a").await.unwrap();
        assert_eq!(db.get("sys-audio", "/a"), None);
    }

    #[tokio::test]
    async fn test_unreachable() {
        let db = MemoryQubesDb::new();
        db.set("sys-audio", "/a", b"1");
        db.set_unreachable("sys-audio", true);
        assert!(db.read("sys-audio", "/a").await.is_err());
        assert!(db.write("sys-audio", "/a", b"0").await.is_err());
        assert_eq!(db.get("sys-audio", "/a"), Some(b"1".to_vec()));
    }
}
