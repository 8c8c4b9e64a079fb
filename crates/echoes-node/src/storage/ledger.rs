//! The [`Store`] implementation, written once over [`KvBackend`].

use super::kv::{KvBackend, KvTxn};
use super::{
    AppendOutcome, AppendRequest, Appended, ClosureClaim, ClosureCompletion, Store,
};
use crate::error::{Error, Result};
use crate::models::{
    Epoch, EpochCounters, EpochId, EpochStats, EpochStatus, LayerMoment, Message, MessageDraft,
    RateLimitRecord,
};
use chrono::{DateTime, Utc};
use echoes_layers::LayerIndex;
use serde::de::DeserializeOwned;
use serde::Serialize;

const CURRENT_EPOCH_KEY: &str = "meta:current_epoch";
const EPOCH_PREFIX: &str = "epoch:";
const ADMIN_PREFIX: &str = "admin:";

fn epoch_key(id: EpochId) -> String {
    format!("epoch:{:016x}", id)
}

fn counters_key(id: EpochId) -> String {
    format!("counters:{:016x}", id)
}

fn message_prefix(epoch: EpochId) -> String {
    format!("msg:{:016x}:", epoch)
}

fn message_key(epoch: EpochId, sequence: u64) -> String {
    format!("msg:{:016x}:{:016x}", epoch, sequence)
}

fn norm_key(epoch: EpochId, normalized_text: &str) -> String {
    format!("norm:{:016x}:{}", epoch, blake3::hash(normalized_text.as_bytes()).to_hex())
}

fn moment_prefix(epoch: EpochId) -> String {
    format!("moment:{:016x}:", epoch)
}

fn moment_key(epoch: EpochId, layer: LayerIndex) -> String {
    format!("moment:{:016x}:{:08x}", epoch, layer.0)
}

fn rate_key(identifier: &str) -> String {
    format!("rate:{}", identifier)
}

fn admin_key(public_key: &str) -> String {
    format!("admin:{}", public_key)
}

fn decode<T: DeserializeOwned>(data: Option<Vec<u8>>) -> Result<Option<T>> {
    match data {
        Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
        None => Ok(None),
    }
}

fn load<T: DeserializeOwned>(txn: &mut dyn KvTxn, key: &str) -> Result<Option<T>> {
    decode(txn.get_for_update(key)?)
}

fn save<T: Serialize>(txn: &mut dyn KvTxn, key: &str, value: &T) -> Result<()> {
    txn.put(key, &serde_json::to_vec(value)?)
}

/// Load the current epoch inside a transaction, locking the pointer and the record.
fn load_current(txn: &mut dyn KvTxn) -> Result<Option<Epoch>> {
    let Some(id) = load::<EpochId>(txn, CURRENT_EPOCH_KEY)? else {
        return Ok(None);
    };
    let epoch = load::<Epoch>(txn, &epoch_key(id))?.ok_or_else(|| {
        Error::Invariant(format!("current epoch {} has no record", id))
    })?;
    Ok(Some(epoch))
}

/// Message store over any transactional key-value backend.
pub struct Ledger<B> {
    backend: B,
}

impl<B: KvBackend> Ledger<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// The underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        decode(self.backend.get(key)?)
    }
}

impl<B: KvBackend> Store for Ledger<B> {
    // --- Epochs ---

    fn bootstrap(&self, now: DateTime<Utc>) -> Result<Epoch> {
        self.backend.transact(|txn| {
            if let Some(epoch) = load_current(txn)? {
                return Ok(epoch);
            }
            let epoch = Epoch::new(1, now);
            save(txn, &epoch_key(epoch.id), &epoch)?;
            save(txn, &counters_key(epoch.id), &EpochCounters::default())?;
            save(txn, CURRENT_EPOCH_KEY, &epoch.id)?;
            tracing::info!("Created initial epoch {}", epoch.name);
            Ok(epoch)
        })
    }

    fn current_epoch(&self) -> Result<Option<Epoch>> {
        match self.get_json::<EpochId>(CURRENT_EPOCH_KEY)? {
            Some(id) => self.get_epoch(id),
            None => Ok(None),
        }
    }

    fn get_epoch(&self, id: EpochId) -> Result<Option<Epoch>> {
        self.get_json(&epoch_key(id))
    }

    fn list_epochs(&self) -> Result<Vec<Epoch>> {
        let mut epochs: Vec<Epoch> = Vec::new();
        self.backend.scan_prefix(EPOCH_PREFIX, &mut |_, value| {
            epochs.push(serde_json::from_slice(value)?);
            Ok(())
        })?;
        Ok(epochs)
    }

    fn claim_closure(&self, id: EpochId) -> Result<ClosureClaim> {
        self.backend.transact(|txn| {
            let key = epoch_key(id);
            let Some(mut epoch) = load::<Epoch>(txn, &key)? else {
                return Ok(ClosureClaim::NotFound);
            };
            match epoch.status {
                EpochStatus::Active => {
                    epoch.status = EpochStatus::Closing;
                    save(txn, &key, &epoch)?;
                    Ok(ClosureClaim::Claimed(epoch))
                }
                EpochStatus::Closing => Ok(ClosureClaim::AlreadyClosing(epoch)),
                EpochStatus::Closed => Ok(ClosureClaim::AlreadyClosed(epoch)),
            }
        })
    }

    fn complete_closure(
        &self,
        id: EpochId,
        stats: EpochStats,
        closed_at: DateTime<Utc>,
    ) -> Result<ClosureCompletion> {
        self.backend.transact(|txn| {
            let current = load::<EpochId>(txn, CURRENT_EPOCH_KEY)?;
            let key = epoch_key(id);
            let Some(mut epoch) = load::<Epoch>(txn, &key)? else {
                return Ok(ClosureCompletion::NotFound);
            };
            if epoch.status != EpochStatus::Closing {
                return Ok(ClosureCompletion::NotClosing(epoch));
            }
            if current != Some(id) {
                return Err(Error::Invariant(format!(
                    "closing epoch {} is not current ({:?})",
                    id, current
                )));
            }

            let successor = epoch.successor(closed_at);
            let successor_key = epoch_key(successor.id);
            if load::<Epoch>(txn, &successor_key)?.is_some() {
                return Err(Error::Invariant(format!(
                    "successor epoch {} already exists",
                    successor.id
                )));
            }

            epoch.status = EpochStatus::Closed;
            epoch.closed_at = Some(closed_at);
            epoch.stats = Some(stats);
            save(txn, &key, &epoch)?;
            save(txn, &successor_key, &successor)?;
            save(txn, &counters_key(successor.id), &EpochCounters::default())?;
            save(txn, CURRENT_EPOCH_KEY, &successor.id)?;

            Ok(ClosureCompletion::Completed {
                closed: epoch,
                successor,
            })
        })
    }

    // --- Messages ---

    fn append_message(
        &self,
        draft: &MessageDraft,
        request: AppendRequest<'_>,
    ) -> Result<AppendOutcome> {
        self.backend.transact(|txn| {
            // the pointer lock serializes appends and closure completion
            let Some(mut epoch) = load_current(txn)? else {
                return Ok(AppendOutcome::NoCurrentEpoch);
            };
            if !epoch.is_active() {
                return Ok(AppendOutcome::EpochNotAccepting { epoch });
            }

            let counters_key = counters_key(epoch.id);
            let mut counters = load::<EpochCounters>(txn, &counters_key)?.unwrap_or_default();
            if counters.total >= request.threshold {
                return Ok(AppendOutcome::EpochNotAccepting { epoch });
            }

            let quota = match request.quota {
                Some(claim) => {
                    let key = rate_key(&claim.identifier);
                    let existing = load::<RateLimitRecord>(txn, &key)?;
                    match claim.charge(existing, draft.created_at) {
                        Ok(record) => {
                            save(txn, &key, &record)?;
                            Some(record)
                        }
                        Err(reset_at) => return Ok(AppendOutcome::QuotaExhausted { reset_at }),
                    }
                }
                None => None,
            };

            let sequence = counters.total;
            let placement = request
                .layers
                .place(sequence, |layer| counters.in_layer(layer));
            let opened_layer =
                sequence > 0 && counters.in_layer(placement.layer) == 0;

            let norm_key = norm_key(epoch.id, &draft.normalized_text);
            let echo_count = load::<u64>(txn, &norm_key)?.unwrap_or(0) + 1;
            save(txn, &norm_key, &echo_count)?;

            counters.record(placement, echo_count == 1);
            save(txn, &counters_key, &counters)?;

            let message = Message {
                id: Message::generate_id(epoch.id, sequence, &draft.normalized_text),
                epoch_id: epoch.id,
                sequence,
                layer_index: placement.layer,
                room_index: placement.room,
                text: draft.text.clone(),
                normalized_text: draft.normalized_text.clone(),
                created_at: draft.created_at,
            };
            save(txn, &message_key(epoch.id, sequence), &message)?;

            let claimed_closure = counters.total >= request.threshold;
            if claimed_closure {
                epoch.status = EpochStatus::Closing;
                save(txn, &epoch_key(epoch.id), &epoch)?;
            }

            Ok(AppendOutcome::Appended(Appended {
                message,
                epoch_name: epoch.name,
                total: counters.total,
                echo_count,
                quota,
                claimed_closure,
                opened_layer,
            }))
        })
    }

    fn counters(&self, epoch: EpochId) -> Result<EpochCounters> {
        Ok(self
            .get_json(&counters_key(epoch))?
            .unwrap_or_default())
    }

    fn echo_count(&self, epoch: EpochId, normalized_text: &str) -> Result<u64> {
        Ok(self
            .get_json(&norm_key(epoch, normalized_text))?
            .unwrap_or(0))
    }

    fn for_each_message(
        &self,
        epoch: EpochId,
        visit: &mut dyn FnMut(Message) -> Result<()>,
    ) -> Result<()> {
        self.backend
            .scan_prefix(&message_prefix(epoch), &mut |_, value| {
                visit(serde_json::from_slice(value)?)
            })
    }

    // --- Layer moments ---

    fn record_layer_moment(&self, moment: &LayerMoment) -> Result<Option<LayerMoment>> {
        self.backend.transact(|txn| {
            let key = moment_key(moment.epoch_id, moment.layer);
            if let Some(existing) = load::<LayerMoment>(txn, &key)? {
                return Ok(Some(existing));
            }
            save(txn, &key, moment)?;
            Ok(None)
        })
    }

    fn layer_moment(&self, epoch: EpochId, layer: LayerIndex) -> Result<Option<LayerMoment>> {
        self.get_json(&moment_key(epoch, layer))
    }

    fn layer_moments(&self, epoch: EpochId) -> Result<Vec<LayerMoment>> {
        let mut moments = Vec::new();
        self.backend.scan_prefix(&moment_prefix(epoch), &mut |_, value| {
            moments.push(serde_json::from_slice(value)?);
            Ok(())
        })?;
        Ok(moments)
    }

    // --- Rate limits ---

    fn rate_limit(&self, identifier: &str) -> Result<Option<RateLimitRecord>> {
        self.get_json(&rate_key(identifier))
    }

    // --- Admins ---

    fn is_admin(&self, public_key: &str) -> Result<bool> {
        Ok(self.backend.get(&admin_key(public_key))?.is_some())
    }

    fn set_admin(&self, public_key: &str, is_admin: bool) -> Result<()> {
        let key = admin_key(public_key);
        if is_admin {
            self.backend.put(&key, b"1")
        } else {
            self.backend.delete(&key)
        }
    }

    fn list_admins(&self) -> Result<Vec<String>> {
        let mut admins = Vec::new();
        self.backend.scan_prefix(ADMIN_PREFIX, &mut |key, _| {
            let key = String::from_utf8_lossy(key);
            if let Some(pk) = key.strip_prefix(ADMIN_PREFIX) {
                admins.push(pk.to_string());
            }
            Ok(())
        })?;
        Ok(admins)
    }
}
