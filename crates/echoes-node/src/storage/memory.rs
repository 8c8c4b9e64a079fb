//! In-memory backend for tests and embedding.

use super::kv::{KvBackend, KvTxn};
use super::ledger::Ledger;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// A store that lives and dies with the process.
pub type MemoryStore = Ledger<MemoryBackend>;

/// Ordered map behind a single lock. Transactions hold the lock for their
/// whole duration, so they are serializable.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_commits: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every transaction fail at commit time, after its work has run.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

impl MemoryStore {
    /// An empty in-memory store.
    pub fn in_memory() -> Self {
        Ledger::new(MemoryBackend::new())
    }
}

struct MemoryTxn<'a> {
    committed: &'a BTreeMap<String, Vec<u8>>,
    writes: BTreeMap<String, Vec<u8>>,
}

impl KvTxn for MemoryTxn<'_> {
    fn get_for_update(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .writes
            .get(key)
            .or_else(|| self.committed.get(key))
            .cloned())
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.writes.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.data.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.data.lock().remove(key);
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &str,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        let data = self.data.lock();
        for (key, value) in data.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            visit(key.as_bytes(), value)?;
        }
        Ok(())
    }

    fn transact<T>(&self, work: impl FnOnce(&mut dyn KvTxn) -> Result<T>) -> Result<T> {
        let mut data = self.data.lock();
        let mut txn = MemoryTxn {
            committed: &data,
            writes: BTreeMap::new(),
        };
        let value = work(&mut txn)?;
        let writes = txn.writes;
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(Error::Storage("commit failed".into()));
        }
        data.extend(writes);
        Ok(value)
    }
}
