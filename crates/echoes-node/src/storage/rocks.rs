//! RocksDB backend using a pessimistic transaction database.

use super::kv::{KvBackend, KvTxn};
use super::ledger::Ledger;
use crate::error::Result;
use rocksdb::{Options, Transaction, TransactionDB, TransactionDBOptions};
use std::path::Path;

/// How long a transaction waits for a key lock before failing.
const LOCK_TIMEOUT_MS: i64 = 10_000;

/// The node's durable store.
pub type RocksStore = Ledger<RocksBackend>;

/// RocksDB-backed key-value storage.
pub struct RocksBackend {
    db: TransactionDB,
}

impl RocksBackend {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let mut txn_opts = TransactionDBOptions::default();
        txn_opts.set_txn_lock_timeout(LOCK_TIMEOUT_MS);
        let db = TransactionDB::open(&opts, &txn_opts, path)?;
        Ok(Self { db })
    }
}

impl RocksStore {
    /// Open or create storage at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Ledger::new(RocksBackend::open(path)?))
    }
}

struct RocksTxn<'db> {
    txn: Transaction<'db, TransactionDB>,
}

impl KvTxn for RocksTxn<'_> {
    fn get_for_update(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.txn.get_for_update(key.as_bytes(), true)?)
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.txn.put(key.as_bytes(), value)?;
        Ok(())
    }
}

impl KvBackend for RocksBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key.as_bytes())?)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db.put(key.as_bytes(), value)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db.delete(key.as_bytes())?;
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &str,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        let prefix = prefix.as_bytes();
        let iter = self.db.prefix_iterator(prefix);
        for item in iter {
            let (key, value) = item?;
            if key.starts_with(prefix) {
                visit(&key, &value)?;
            } else {
                break;
            }
        }
        Ok(())
    }

    fn transact<T>(&self, work: impl FnOnce(&mut dyn KvTxn) -> Result<T>) -> Result<T> {
        let mut txn = RocksTxn {
            txn: self.db.transaction(),
        };
        // an uncommitted transaction rolls back when dropped
        let value = work(&mut txn)?;
        txn.txn.commit()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn prefix_scan_stays_in_prefix() {
        let dir = tempdir().unwrap();
        let backend = RocksBackend::open(dir.path()).unwrap();
        backend.put("a:1", b"x").unwrap();
        backend.put("b:1", b"y").unwrap();
        backend.put("b:2", b"z").unwrap();
        backend.put("c:1", b"w").unwrap();

        let mut seen = Vec::new();
        backend
            .scan_prefix("b:", &mut |key, _| {
                seen.push(String::from_utf8_lossy(key).into_owned());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec!["b:1", "b:2"]);
    }

    #[test]
    fn failed_transaction_writes_nothing() {
        let dir = tempdir().unwrap();
        let backend = RocksBackend::open(dir.path()).unwrap();
        let result: Result<()> = backend.transact(|txn| {
            txn.put("k", b"v")?;
            Err(crate::error::Error::InvalidInput("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(backend.get("k").unwrap(), None);

        backend
            .transact(|txn| {
                assert_eq!(txn.get_for_update("k")?, None);
                txn.put("k", b"v")?;
                // own writes are visible
                assert_eq!(txn.get_for_update("k")?, Some(b"v".to_vec()));
                Ok(())
            })
            .unwrap();
        assert_eq!(backend.get("k").unwrap(), Some(b"v".to_vec()));
    }
}
