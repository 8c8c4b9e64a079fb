//! The library: every operation the outer surfaces call.
//!
//! ```text
//! submit ─▶ identity ─▶ spam guard ─▶ quota ─▶ validate ─▶ store append
//!                                                           │
//!                                      threshold reached ◀──┘
//!                                              │
//!                               aggregate ─▶ narrate ─▶ close + successor
//! ```

use crate::clock::{Clock, SystemClock};
use crate::epoch::{ClosureOutcome, EpochMachine};
use crate::error::{Error, Result, SubmitError};
use crate::events::{self, emit, EventSender, LibraryEvent};
use crate::identity::{CallerContext, Identity, IdentityResolver, SessionTokenVerifier, TokenVerifier};
use crate::models::{
    Epoch, EpochAggregate, EpochId, EpochStats, EpochStatus, LayerMoment, MessageDraft,
    NarrativeDraft, RoomOccupancy,
};
use crate::moments::LayerMoments;
use crate::narrative::Narrator;
use crate::rate_limit::{QuotaDecision, QuotaPolicy, QuotaStatus, RateLimiter};
use crate::spam_guard::{Admission, SpamGuard, SpamGuardConfig};
use crate::stats::{Aggregator, AggregatorConfig};
use crate::storage::{AppendOutcome, AppendRequest, Appended, Store};
use crate::text;
use chrono::{DateTime, Utc};
use echoes_layers::{LayerIndex, LayerTable, RoomIndex, DEFAULT_BABEL_THRESHOLD};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Tunables of a library.
#[derive(Debug, Clone)]
pub struct LibraryConfig {
    /// Messages per epoch before closure
    pub threshold: u64,

    /// Layer table used for placement
    pub layers: LayerTable,

    /// Daily quotas
    pub quota: QuotaPolicy,

    /// Burst detection
    pub spam: SpamGuardConfig,

    /// Aggregation sizes and histogram offset
    pub stats: AggregatorConfig,

    /// Keys the anonymous address hash
    pub address_salt: String,

    /// Take the client address from `X-Forwarded-For` and friends
    pub trust_proxy_headers: bool,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_BABEL_THRESHOLD,
            layers: LayerTable::standard(),
            quota: QuotaPolicy::default(),
            spam: SpamGuardConfig::default(),
            stats: AggregatorConfig::default(),
            address_salt: "echoes".to_string(),
            trust_proxy_headers: true,
        }
    }
}

// --- Views ---

/// Receipt of an accepted message.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub epoch_name: String,
    pub layer_index: LayerIndex,
    pub room_index: RoomIndex,
    pub echo_count_for_this_text: u64,
    /// `None` when unlimited
    pub remaining_quota: Option<u32>,
    pub threshold_reached: bool,
}

/// Where the current epoch stands.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemState {
    pub epoch_id: EpochId,
    pub epoch_name: String,
    pub status: EpochStatus,
    pub layer_index: LayerIndex,
    pub layer_name: String,
    pub total_messages: u64,
    pub threshold: u64,
    /// Progress through the current layer
    pub layer_progress: f64,
    pub threshold_reached: bool,
}

/// One layer of the live stats.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LayerStatus {
    pub layer: LayerIndex,
    pub name: String,
    pub min_count: u64,
    pub max_count: Option<u64>,
    pub room_count: u32,
    pub room_capacity: u32,
    pub messages: u64,
    pub active_rooms: usize,
    pub rooms: Vec<RoomOccupancy>,
}

/// Live statistics of the current epoch.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiveStats {
    pub epoch_id: EpochId,
    pub epoch_name: String,
    pub total_messages: u64,
    pub unique_messages: u64,
    pub echo_count: u64,
    /// Echoes per message, 0 when empty
    pub echo_rate: f64,
    pub current_layer: LayerIndex,
    pub current_layer_name: String,
    pub layers: Vec<LayerStatus>,
}

/// A closed epoch with its archive.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClosedEpochView {
    pub epoch_id: EpochId,
    pub epoch_name: String,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub stats: EpochStats,
}

/// An epoch in the listing.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EpochSummary {
    pub id: EpochId,
    pub name: String,
    pub status: EpochStatus,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub total_messages: u64,
    /// `None` until closed
    pub stats: Option<EpochStats>,
}

/// One occupied room of the message map.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomMapEntry {
    pub layer_index: LayerIndex,
    pub room_index: RoomIndex,
    pub message_count: u64,
    pub first_message_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
}

/// Occupied rooms of one epoch.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EpochMap {
    pub epoch_id: EpochId,
    pub epoch_name: String,
    pub is_active: bool,
    pub total_messages: u64,
    pub total_rooms: usize,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub rooms: Vec<RoomMapEntry>,
}

// --- Library ---

/// Assembles a [`Library`].
pub struct LibraryBuilder {
    store: Arc<dyn Store>,
    config: LibraryConfig,
    clock: Arc<dyn Clock>,
    narrator: Narrator,
    verifier: Arc<dyn TokenVerifier>,
}

impl LibraryBuilder {
    pub fn config(mut self, config: LibraryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn narrator(mut self, narrator: Narrator) -> Self {
        self.narrator = narrator;
        self
    }

    pub fn token_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Build the library and make sure a current epoch exists.
    pub fn build(self) -> Result<Library> {
        let LibraryConfig {
            threshold,
            layers,
            quota,
            spam,
            stats,
            address_salt,
            trust_proxy_headers,
        } = self.config;
        if threshold == 0 {
            return Err(Error::Config("threshold must be positive".into()));
        }

        let layers = Arc::new(layers);
        let events = events::channel();
        let aggregator = Aggregator::new(stats, Arc::clone(&layers));
        let narrator = Arc::new(self.narrator);
        let moments = LayerMoments::new(
            Arc::clone(&self.store),
            aggregator.clone(),
            Arc::clone(&layers),
            Arc::clone(&narrator),
            events.clone(),
        );
        let epochs = Arc::new(EpochMachine::new(
            Arc::clone(&self.store),
            aggregator,
            narrator,
            Arc::clone(&self.clock),
            threshold,
            events.clone(),
        ));
        let current = epochs.bootstrap()?;
        tracing::info!("Current epoch: {} ({:?})", current.name, current.status);

        Ok(Library {
            identities: IdentityResolver::new(&address_salt, self.verifier, Arc::clone(&self.store)),
            spam: SpamGuard::new(spam, Arc::clone(&self.clock)),
            quotas: RateLimiter::new(quota, Arc::clone(&self.store), Arc::clone(&self.clock)),
            store: self.store,
            layers,
            epochs,
            moments,
            clock: self.clock,
            events,
            trust_proxy_headers,
        })
    }
}

/// The ingestion core shared by the HTTP API, the event stream and the
/// admin socket.
pub struct Library {
    store: Arc<dyn Store>,
    layers: Arc<LayerTable>,
    identities: IdentityResolver,
    spam: SpamGuard,
    quotas: RateLimiter,
    epochs: Arc<EpochMachine>,
    moments: LayerMoments,
    clock: Arc<dyn Clock>,
    events: EventSender,
    trust_proxy_headers: bool,
}

impl Library {
    pub fn builder(store: Arc<dyn Store>) -> LibraryBuilder {
        LibraryBuilder {
            store,
            config: LibraryConfig::default(),
            clock: Arc::new(SystemClock),
            narrator: Narrator::template_only(),
            verifier: Arc::new(SessionTokenVerifier),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn layers(&self) -> &LayerTable {
        &self.layers
    }

    pub fn threshold(&self) -> u64 {
        self.epochs.threshold()
    }

    /// Whether callers are identified by proxy headers.
    pub fn trusts_proxy_headers(&self) -> bool {
        self.trust_proxy_headers
    }

    /// Subscribe to library events.
    pub fn subscribe(&self) -> broadcast::Receiver<LibraryEvent> {
        self.events.subscribe()
    }

    pub fn resolve_identity(&self, caller: &CallerContext) -> Identity {
        self.identities.resolve(caller, self.clock.now())
    }

    // --- Submission ---

    /// Accept, place and persist one message.
    pub async fn submit_message(
        &self,
        raw: &str,
        caller: &CallerContext,
    ) -> std::result::Result<SubmitReceipt, SubmitError> {
        let identity = self.resolve_identity(caller);

        if let Admission::Blocked { until } = self.spam.admit(&identity.identifier) {
            tracing::warn!(identifier = %identity.identifier, "Submission blocked until {}", until);
            return Err(SubmitError::AbuseBlocked { until });
        }

        let claim = match self.quotas.check_and_reserve(&identity).map_err(SubmitError::Store)? {
            QuotaDecision::Allowed { claim, .. } => claim,
            QuotaDecision::Denied { reset_at } => return Err(self.quota_exceeded(&identity, reset_at)),
        };

        if let Err(rejection) = text::validate(raw) {
            tracing::warn!(identifier = %identity.identifier, "Message rejected: {}", rejection);
            return Err(rejection.into());
        }

        let draft = MessageDraft::new(raw, self.clock.now());
        let request = AppendRequest {
            layers: &self.layers,
            threshold: self.epochs.threshold(),
            quota: claim.as_ref(),
        };
        let outcome = self.store.append_message(&draft, request).map_err(|e| {
            tracing::error!(identifier = %identity.identifier, "Append failed, outcome uncertain: {}", e);
            SubmitError::Store(e)
        })?;

        match outcome {
            AppendOutcome::Appended(appended) => Ok(self.accepted(appended, claim.map(|c| c.limit)).await),
            AppendOutcome::QuotaExhausted { reset_at } => Err(self.quota_exceeded(&identity, reset_at)),
            AppendOutcome::EpochNotAccepting { epoch } => {
                if epoch.status == EpochStatus::Closing && !self.epochs.is_closing(epoch.id) {
                    self.spawn_resume();
                }
                Err(SubmitError::EpochTransition {
                    epoch_name: epoch.name,
                })
            }
            AppendOutcome::NoCurrentEpoch => {
                tracing::error!("Append found no current epoch");
                Err(SubmitError::NoActiveEpoch)
            }
        }
    }

    async fn accepted(&self, appended: Appended, limit: Option<u32>) -> SubmitReceipt {
        let message = &appended.message;
        tracing::debug!(
            epoch = message.epoch_id,
            sequence = message.sequence,
            layer = %message.layer_index,
            room = %message.room_index,
            "Message placed"
        );

        emit(
            &self.events,
            LibraryEvent::MessagePlaced {
                epoch_id: message.epoch_id,
                layer: message.layer_index,
                room: message.room_index,
                total: appended.total,
                echo_count: appended.echo_count,
            },
        );
        if appended.opened_layer {
            let name = self
                .layers
                .get(message.layer_index)
                .map(|layer| layer.name.clone())
                .unwrap_or_default();
            tracing::info!("{} reached layer {} ({})", appended.epoch_name, message.layer_index, name);
            emit(
                &self.events,
                LibraryEvent::LayerReached {
                    epoch_id: message.epoch_id,
                    layer: message.layer_index,
                    name,
                    total: appended.total,
                },
            );
        }

        let threshold_reached = appended.claimed_closure || appended.total >= self.epochs.threshold();
        if appended.claimed_closure {
            tracing::info!("{} reached the threshold", appended.epoch_name);
            // the message is durable; a failed closure stays claimed and is resumed later
            if let Err(e) = self.epochs.finish_claimed(message.epoch_id).await {
                tracing::error!("Closure of {} failed: {}", appended.epoch_name, e);
            }
        }

        let remaining_quota = match (limit, &appended.quota) {
            (Some(limit), Some(record)) => Some(limit.saturating_sub(record.count)),
            _ => None,
        };
        SubmitReceipt {
            epoch_name: appended.epoch_name,
            layer_index: appended.message.layer_index,
            room_index: appended.message.room_index,
            echo_count_for_this_text: appended.echo_count,
            remaining_quota,
            threshold_reached,
        }
    }

    fn quota_exceeded(&self, identity: &Identity, reset_at: DateTime<Utc>) -> SubmitError {
        tracing::warn!(identifier = %identity.identifier, "Quota exhausted until {}", reset_at);
        SubmitError::QuotaExceeded {
            reset_in_seconds: self.quotas.seconds_until(reset_at),
            requires_auth: !identity.is_authenticated,
        }
    }

    fn spawn_resume(&self) {
        let epochs = Arc::clone(&self.epochs);
        tokio::spawn(async move {
            if let Err(e) = epochs.resume_pending_closure().await {
                tracing::error!("Resuming closure failed: {}", e);
            }
        });
    }

    /// Quota of the caller without consuming anything.
    pub fn remaining_quota(&self, caller: &CallerContext) -> Result<QuotaStatus> {
        self.quotas.remaining(&self.resolve_identity(caller))
    }

    // --- Epochs ---

    /// Current epoch, its layer and closeness to the threshold.
    pub fn system_state(&self) -> Result<SystemState> {
        let epoch = self.epochs.current()?;
        let total = self.store.counters(epoch.id)?.total;
        let layer = self.layers.layer_for(total);
        let threshold = self.epochs.threshold();
        Ok(SystemState {
            epoch_id: epoch.id,
            epoch_name: epoch.name,
            status: epoch.status,
            layer_index: layer.index,
            layer_name: layer.name.clone(),
            total_messages: total,
            threshold,
            layer_progress: layer.progress_percent(total),
            threshold_reached: total >= threshold,
        })
    }

    /// Live layer, room and echo statistics of the current epoch.
    pub fn live_stats(&self) -> Result<LiveStats> {
        let epoch = self.epochs.current()?;
        let counters = self.store.counters(epoch.id)?;
        let current = self.layers.layer_for(counters.total);

        let layers = self
            .layers
            .layers()
            .iter()
            .map(|def| LayerStatus {
                layer: def.index,
                name: def.name.clone(),
                min_count: def.min_count,
                max_count: def.max_count,
                room_count: def.room_count,
                room_capacity: def.room_capacity,
                messages: counters.in_layer(def.index),
                active_rooms: counters.active_rooms(def.index),
                rooms: counters
                    .per_room
                    .get(&def.index)
                    .map(|rooms| {
                        rooms
                            .iter()
                            .map(|(&room, &messages)| RoomOccupancy { room, messages })
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .collect();

        let echo_count = counters.echoes();
        Ok(LiveStats {
            epoch_id: epoch.id,
            epoch_name: epoch.name,
            total_messages: counters.total,
            unique_messages: counters.unique,
            echo_count,
            echo_rate: if counters.total == 0 {
                0.0
            } else {
                echo_count as f64 / counters.total as f64
            },
            current_layer: current.index,
            current_layer_name: current.name.clone(),
            layers,
        })
    }

    /// Archive of a closed epoch, the most recent one by default.
    pub fn closed_epoch_narrative(&self, id: Option<EpochId>) -> Result<Option<ClosedEpochView>> {
        let epoch = match id {
            Some(id) => self.store.get_epoch(id)?,
            None => self.store.latest_closed_epoch()?,
        };
        Ok(epoch.and_then(|epoch| {
            let stats = epoch.stats?;
            Some(ClosedEpochView {
                epoch_id: epoch.id,
                epoch_name: epoch.name,
                created_at: epoch.created_at,
                closed_at: epoch.closed_at,
                stats,
            })
        }))
    }

    /// Snapshot of the layer the current epoch is in, captured and stored on
    /// first request. `None` while the epoch is empty.
    pub async fn layer_moment(&self) -> Result<Option<LayerMoment>> {
        let epoch = self.epochs.current()?;
        self.moments.capture(&epoch).await
    }

    /// Stored layer moments of an epoch, lowest layer first.
    pub fn layer_moments(&self, id: EpochId) -> Result<Vec<LayerMoment>> {
        let epoch = self
            .store
            .get_epoch(id)?
            .ok_or_else(|| Error::NotFound(Epoch::name_for(id)))?;
        self.moments.history(&epoch)
    }

    /// Close an epoch with an administrator's narrative.
    pub async fn supply_manual_narrative(
        &self,
        id: EpochId,
        draft: NarrativeDraft,
        by: &str,
    ) -> Result<ClosureOutcome> {
        let narrative = draft.validate().map_err(|missing| {
            Error::InvalidInput(format!("missing narrative fields: {}", missing.join(", ")))
        })?;
        tracing::info!(by, "Manual narrative supplied for epoch {}", id);
        self.epochs.close_with_narrative(id, narrative, by.to_string()).await
    }

    /// Close the current epoch if it is at the threshold or stuck closing.
    pub async fn resume_pending_closure(&self) -> Result<Option<ClosureOutcome>> {
        self.epochs.resume_pending_closure().await
    }

    /// All epochs, oldest first.
    pub fn epochs(&self) -> Result<Vec<EpochSummary>> {
        self.store
            .list_epochs()?
            .into_iter()
            .map(|epoch| -> Result<EpochSummary> {
                let total_messages = match &epoch.stats {
                    Some(stats) => stats.aggregate.total_messages,
                    None => self.store.counters(epoch.id)?.total,
                };
                Ok(EpochSummary {
                    id: epoch.id,
                    name: epoch.name,
                    status: epoch.status,
                    is_active: epoch.status == EpochStatus::Active,
                    created_at: epoch.created_at,
                    closed_at: epoch.closed_at,
                    total_messages,
                    stats: epoch.stats,
                })
            })
            .collect()
    }

    /// Occupied rooms of every epoch, newest epoch first.
    pub async fn message_map(&self) -> Result<Vec<EpochMap>> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || -> Result<Vec<EpochMap>> {
            let mut maps = Vec::new();
            for epoch in store.list_epochs()?.into_iter().rev() {
                maps.push(map_epoch(store.as_ref(), epoch)?);
            }
            Ok(maps)
        })
        .await
        .map_err(|e| Error::Invariant(format!("message map task failed: {}", e)))?
    }

    /// Aggregate of an epoch as it stands, for narrative authoring.
    pub async fn export_epoch(&self, id: EpochId) -> Result<EpochAggregate> {
        let epoch = self
            .store
            .get_epoch(id)?
            .ok_or_else(|| Error::NotFound(Epoch::name_for(id)))?;
        self.epochs.aggregate(&epoch).await
    }
}

fn map_epoch(store: &dyn Store, epoch: Epoch) -> Result<EpochMap> {
    let mut rooms: BTreeMap<(LayerIndex, RoomIndex), RoomMapEntry> = BTreeMap::new();
    let mut total_messages = 0;
    store.for_each_message(epoch.id, &mut |message| {
        total_messages += 1;
        rooms
            .entry((message.layer_index, message.room_index))
            .and_modify(|entry| {
                entry.message_count += 1;
                entry.first_message_at = entry.first_message_at.min(message.created_at);
                entry.last_message_at = entry.last_message_at.max(message.created_at);
            })
            .or_insert(RoomMapEntry {
                layer_index: message.layer_index,
                room_index: message.room_index,
                message_count: 1,
                first_message_at: message.created_at,
                last_message_at: message.created_at,
            });
        Ok(())
    })?;

    Ok(EpochMap {
        epoch_id: epoch.id,
        epoch_name: epoch.name,
        is_active: epoch.status == EpochStatus::Active,
        total_messages,
        total_rooms: rooms.len(),
        created_at: epoch.created_at,
        closed_at: epoch.closed_at,
        rooms: rooms.into_values().collect(),
    })
}
