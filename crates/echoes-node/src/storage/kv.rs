//! The key-value interface [`Ledger`](super::Ledger) is written against.

use crate::error::Result;

/// One atomic unit of work.
///
/// Writes become visible together when the enclosing
/// [`KvBackend::transact`] returns `Ok`, and are discarded otherwise.
pub trait KvTxn {
    /// Read a key and hold it exclusively until the transaction ends.
    fn get_for_update(&mut self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Buffer a write.
    fn put(&mut self, key: &str, value: &[u8]) -> Result<()>;
}

/// A transactional, ordered key-value store.
pub trait KvBackend: Send + Sync {
    /// Read a committed value.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a single value outside any transaction.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Delete a single value outside any transaction.
    fn delete(&self, key: &str) -> Result<()>;

    /// Visit every committed entry whose key starts with `prefix`, in key order.
    fn scan_prefix(
        &self,
        prefix: &str,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()>;

    /// Run `work` in a transaction, committing if it returns `Ok`.
    fn transact<T>(&self, work: impl FnOnce(&mut dyn KvTxn) -> Result<T>) -> Result<T>;
}
