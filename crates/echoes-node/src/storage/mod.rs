//! Persistent storage.
//!
//! [`Store`] is the seam the rest of the node talks to. There is a single
//! implementation, [`Ledger`], written once against a small transactional
//! key-value interface and instantiated over RocksDB ([`RocksStore`]) or an
//! in-memory map ([`MemoryStore`]).
//!
//! Every state change that has to be atomic is one store call: appending a
//! message (placement, counters, echo count, quota charge and the closure
//! claim), claiming a closure, and completing one.
//!
//! # Key Layout
//!
//! | Key | Value |
//! |-----|-------|
//! | `meta:current_epoch` | id of the current epoch |
//! | `epoch:{id:016x}` | [`Epoch`] |
//! | `counters:{id:016x}` | [`EpochCounters`] |
//! | `msg:{id:016x}:{seq:016x}` | [`Message`] |
//! | `norm:{id:016x}:{blake3}` | occurrences of a normalized text |
//! | `moment:{id:016x}:{layer:08x}` | [`LayerMoment`] |
//! | `rate:{identifier}` | [`RateLimitRecord`] |
//! | `admin:{public_key}` | marker |

mod kv;
mod ledger;
mod memory;
mod rocks;

pub use kv::{KvBackend, KvTxn};
pub use ledger::Ledger;
pub use memory::{MemoryBackend, MemoryStore};
pub use rocks::{RocksBackend, RocksStore};

use crate::error::Result;
use crate::models::{
    Epoch, EpochCounters, EpochId, EpochStats, LayerMoment, Message, MessageDraft, QuotaClaim,
    RateLimitRecord,
};
use chrono::{DateTime, Utc};
use echoes_layers::{LayerIndex, LayerTable};

/// Everything an append needs besides the message itself.
#[derive(Debug, Clone, Copy)]
pub struct AppendRequest<'a> {
    /// Layer table used for placement
    pub layers: &'a LayerTable,

    /// Epoch size at which closure is claimed
    pub threshold: u64,

    /// Quota charge, `None` for unlimited identities
    pub quota: Option<&'a QuotaClaim>,
}

/// Result of [`Store::append_message`].
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    /// The message is durable.
    Appended(Appended),
    /// The quota ceiling was reached before this append; nothing was written.
    QuotaExhausted { reset_at: DateTime<Utc> },
    /// The current epoch is not accepting; nothing was written.
    EpochNotAccepting { epoch: Epoch },
    /// No current epoch exists.
    NoCurrentEpoch,
}

/// A successful append.
#[derive(Debug, Clone)]
pub struct Appended {
    /// The stored message
    pub message: Message,

    /// Name of the epoch it landed in
    pub epoch_name: String,

    /// Epoch total including this message
    pub total: u64,

    /// Occurrences of this normalized text including this one
    pub echo_count: u64,

    /// Quota record after the charge
    pub quota: Option<RateLimitRecord>,

    /// This append reached the threshold and moved the epoch to closing
    pub claimed_closure: bool,

    /// First message of a layer other than the first
    pub opened_layer: bool,
}

/// Result of [`Store::claim_closure`].
#[derive(Debug, Clone)]
pub enum ClosureClaim {
    /// The caller moved the epoch from active to closing and owns the closure.
    Claimed(Epoch),
    AlreadyClosing(Epoch),
    AlreadyClosed(Epoch),
    NotFound,
}

/// Result of [`Store::complete_closure`].
#[derive(Debug, Clone)]
pub enum ClosureCompletion {
    /// The epoch is closed and its successor is current.
    Completed { closed: Epoch, successor: Epoch },
    /// The epoch was not closing (already closed, or never claimed).
    NotClosing(Epoch),
    NotFound,
}

/// Storage seam for the node.
pub trait Store: Send + Sync {
    // --- Epochs ---

    /// Return the current epoch, creating `Age 1` if the store is empty.
    fn bootstrap(&self, now: DateTime<Utc>) -> Result<Epoch>;

    /// The epoch currently accepting (or closing).
    fn current_epoch(&self) -> Result<Option<Epoch>>;

    /// Get an epoch by id.
    fn get_epoch(&self, id: EpochId) -> Result<Option<Epoch>>;

    /// All epochs, oldest first.
    fn list_epochs(&self) -> Result<Vec<Epoch>>;

    /// Most recently closed epoch.
    fn latest_closed_epoch(&self) -> Result<Option<Epoch>> {
        Ok(self
            .list_epochs()?
            .into_iter()
            .rev()
            .find(|epoch| epoch.stats.is_some()))
    }

    /// Atomically move an epoch from active to closing.
    fn claim_closure(&self, id: EpochId) -> Result<ClosureClaim>;

    /// Atomically mark a closing epoch closed with its stats and make
    /// `id + 1` the current epoch.
    fn complete_closure(
        &self,
        id: EpochId,
        stats: EpochStats,
        closed_at: DateTime<Utc>,
    ) -> Result<ClosureCompletion>;

    // --- Messages ---

    /// Place and persist a message in the current epoch.
    fn append_message(&self, draft: &MessageDraft, request: AppendRequest<'_>)
        -> Result<AppendOutcome>;

    /// Running counters of an epoch.
    fn counters(&self, epoch: EpochId) -> Result<EpochCounters>;

    /// Occurrences of a normalized text in an epoch.
    fn echo_count(&self, epoch: EpochId, normalized_text: &str) -> Result<u64>;

    /// Visit the messages of an epoch in sequence order.
    fn for_each_message(
        &self,
        epoch: EpochId,
        visit: &mut dyn FnMut(Message) -> Result<()>,
    ) -> Result<()>;

    /// The messages of an epoch in sequence order.
    fn messages(&self, epoch: EpochId) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        self.for_each_message(epoch, &mut |message| {
            messages.push(message);
            Ok(())
        })?;
        Ok(messages)
    }

    // --- Layer moments ---

    /// Store a moment unless its epoch already has one for that layer.
    /// Returns the moment that was there first, `None` when this one was stored.
    fn record_layer_moment(&self, moment: &LayerMoment) -> Result<Option<LayerMoment>>;

    /// The stored moment of one layer.
    fn layer_moment(&self, epoch: EpochId, layer: LayerIndex) -> Result<Option<LayerMoment>>;

    /// Stored moments of an epoch, lowest layer first.
    fn layer_moments(&self, epoch: EpochId) -> Result<Vec<LayerMoment>>;

    // --- Rate limits ---

    /// Quota record of an identifier.
    fn rate_limit(&self, identifier: &str) -> Result<Option<RateLimitRecord>>;

    // --- Admins ---

    /// Check if a public key is an admin.
    fn is_admin(&self, public_key: &str) -> Result<bool>;

    /// Set or clear admin status.
    fn set_admin(&self, public_key: &str, is_admin: bool) -> Result<()>;

    /// List all admin public keys.
    fn list_admins(&self) -> Result<Vec<String>>;
}
