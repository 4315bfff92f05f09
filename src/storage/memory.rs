//! In-memory storage backend with a byte budget and LRU eviction.
//!
//! Thread-safe default engine behind the [`Storage`] capability. Memory use
//! is tracked per entry (key + value bytes) and capped: storing evicts the
//! least recently used entries until the new entry fits. An entry larger
//! than the whole budget is refused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tracing::{debug, trace};

use crate::error::StorageError;
use crate::storage::Storage;

pub struct MemStorage {
    data: RwLock<HashMap<String, Vec<u8>>>,
    /// Key -> access sequence number, for LRU eviction.
    access_order: RwLock<HashMap<String, u64>>,
    access_counter: AtomicU64,
    memory_used: AtomicU64,
    max_memory: usize,
}

impl MemStorage {
    pub fn new(max_memory: usize) -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            access_order: RwLock::new(HashMap::new()),
            access_counter: AtomicU64::new(0),
            memory_used: AtomicU64::new(0),
            max_memory,
        }
    }

    /// Bytes currently accounted for.
    pub fn memory_used(&self) -> usize {
        self.memory_used.load(Ordering::SeqCst) as usize
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record_access(&self, key: &str) -> Result<(), StorageError> {
        let seq = self.access_counter.fetch_add(1, Ordering::SeqCst);
        let mut order = self
            .access_order
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        order.insert(key.to_string(), seq);
        Ok(())
    }

    fn entry_size(key: &str, value: &[u8]) -> usize {
        key.len() + value.len()
    }

    /// Evict LRU entries until `needed` more bytes fit in the budget.
    fn ensure_memory_available(&self, needed: usize) -> Result<(), StorageError> {
        let mut current = self.memory_used.load(Ordering::SeqCst) as usize;

        while current + needed > self.max_memory {
            match self.find_lru_key()? {
                Some(victim) => {
                    debug!(key = %victim, "evicting LRU entry");
                    self.delete(&victim)?;
                    current = self.memory_used.load(Ordering::SeqCst) as usize;
                }
                None => break,
            }
        }
        Ok(())
    }

    fn find_lru_key(&self) -> Result<Option<String>, StorageError> {
        let order = self
            .access_order
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let data = self.data.read().map_err(|_| StorageError::LockPoisoned)?;

        let mut min_seq = u64::MAX;
        let mut lru_key = None;
        for (key, &seq) in order.iter() {
            if data.contains_key(key) && seq < min_seq {
                min_seq = seq;
                lru_key = Some(key.clone());
            }
        }

        // Entries can exist without an access record if the order map lagged.
        if lru_key.is_none() {
            lru_key = data.keys().next().cloned();
        }

        Ok(lru_key)
    }
}

impl Storage for MemStorage {
    fn put(&self, key: &str, value: &[u8]) -> Result<bool, StorageError> {
        let new_size = Self::entry_size(key, value);
        if new_size > self.max_memory {
            return Ok(false);
        }

        self.ensure_memory_available(new_size)?;

        let mut data = self.data.write().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(old) = data.get(key) {
            let old_size = Self::entry_size(key, old);
            self.memory_used
                .fetch_sub(old_size as u64, Ordering::SeqCst);
        }
        self.memory_used
            .fetch_add(new_size as u64, Ordering::SeqCst);
        data.insert(key.to_string(), value.to_vec());
        drop(data);

        self.record_access(key)?;
        trace!(key, bytes = value.len(), "entry stored");
        Ok(true)
    }

    fn put_if_absent(&self, key: &str, value: &[u8]) -> Result<bool, StorageError> {
        {
            let data = self.data.read().map_err(|_| StorageError::LockPoisoned)?;
            if data.contains_key(key) {
                return Ok(false);
            }
        }
        self.put(key, value)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<bool, StorageError> {
        {
            let data = self.data.read().map_err(|_| StorageError::LockPoisoned)?;
            if !data.contains_key(key) {
                return Ok(false);
            }
        }
        self.put(key, value)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let value = {
            let data = self.data.read().map_err(|_| StorageError::LockPoisoned)?;
            data.get(key).cloned()
        };
        if value.is_some() {
            self.record_access(key)?;
        }
        Ok(value)
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut data = self.data.write().map_err(|_| StorageError::LockPoisoned)?;
        match data.remove(key) {
            Some(value) => {
                let size = Self::entry_size(key, &value);
                self.memory_used.fetch_sub(size as u64, Ordering::SeqCst);
                drop(data);

                let mut order = self
                    .access_order
                    .write()
                    .map_err(|_| StorageError::LockPoisoned)?;
                order.remove(key);
                trace!(key, "entry deleted");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let storage = MemStorage::new(1024 * 1024);
        assert!(storage.put("key1", b"value1").unwrap());
        assert_eq!(storage.get("key1").unwrap().unwrap(), b"value1");
    }

    #[test]
    fn test_get_missing() {
        let storage = MemStorage::new(1024 * 1024);
        assert!(storage.get("nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_put_if_absent() {
        let storage = MemStorage::new(1024 * 1024);
        assert!(storage.put_if_absent("key1", b"one").unwrap());
        assert!(!storage.put_if_absent("key1", b"two").unwrap());
        assert_eq!(storage.get("key1").unwrap().unwrap(), b"one");
    }

    #[test]
    fn test_set_requires_presence() {
        let storage = MemStorage::new(1024 * 1024);
        assert!(!storage.set("key1", b"value").unwrap());

        storage.put("key1", b"old").unwrap();
        assert!(storage.set("key1", b"new").unwrap());
        assert_eq!(storage.get("key1").unwrap().unwrap(), b"new");
    }

    #[test]
    fn test_delete() {
        let storage = MemStorage::new(1024 * 1024);
        storage.put("key1", b"value1").unwrap();

        assert!(storage.delete("key1").unwrap());
        assert!(storage.get("key1").unwrap().is_none());
        assert!(!storage.delete("key1").unwrap());
    }

    #[test]
    fn test_memory_accounting() {
        let storage = MemStorage::new(1024);
        storage.put("abc", b"12345").unwrap();
        assert_eq!(storage.memory_used(), 8);

        storage.put("abc", b"1").unwrap();
        assert_eq!(storage.memory_used(), 4);

        storage.delete("abc").unwrap();
        assert_eq!(storage.memory_used(), 0);
    }

    #[test]
    fn test_oversized_entry_refused() {
        let storage = MemStorage::new(8);
        assert!(!storage.put("key", b"way too large").unwrap());
        assert!(storage.get("key").unwrap().is_none());
    }

    #[test]
    fn test_lru_eviction() {
        // Budget fits two 10-byte entries but not three.
        let storage = MemStorage::new(20);
        storage.put("a", b"123456789").unwrap();
        storage.put("b", b"123456789").unwrap();

        // Touch "a" so "b" becomes the eviction victim.
        storage.get("a").unwrap();

        storage.put("c", b"123456789").unwrap();
        assert!(storage.get("a").unwrap().is_some());
        assert!(storage.get("b").unwrap().is_none());
        assert!(storage.get("c").unwrap().is_some());
    }

    #[test]
    fn test_budget_never_exceeded() {
        let storage = MemStorage::new(100);
        for i in 0..50 {
            let key = format!("key{i}");
            storage.put(&key, &[0u8; 10]).unwrap();
            assert!(storage.memory_used() <= 100);
        }
    }
}
