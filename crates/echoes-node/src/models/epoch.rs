//! Epoch model - one bounded era of message collection.

use super::aggregate::EpochAggregate;
use super::narrative::{Narrative, NarrativeSource};
use chrono::{DateTime, Utc};
use echoes_layers::{LayerIndex, Placement, RoomIndex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Epoch identifier. Starts at 1, successor is always `id + 1`.
pub type EpochId = u64;

/// Current layout of [`EpochStats`].
pub const STATS_SCHEMA_VERSION: u32 = 1;

/// Lifecycle of an epoch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EpochStatus {
    /// Accepting messages
    Active,
    /// Closure claimed and running; appends are refused
    Closing,
    /// Archived with stats
    Closed,
}

/// An epoch record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Epoch {
    /// Sequential identifier
    pub id: EpochId,

    /// Display name, `Age {id}`
    pub name: String,

    /// Lifecycle state
    pub status: EpochStatus,

    /// When the epoch opened
    pub created_at: DateTime<Utc>,

    /// When the epoch closed
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,

    /// Populated once, at closure
    #[serde(default)]
    pub stats: Option<EpochStats>,
}

impl Epoch {
    /// A fresh active epoch.
    pub fn new(id: EpochId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name: Self::name_for(id),
            status: EpochStatus::Active,
            created_at,
            closed_at: None,
            stats: None,
        }
    }

    /// Display name for an epoch id.
    pub fn name_for(id: EpochId) -> String {
        format!("Age {}", id)
    }

    /// Whether appends are accepted.
    pub fn is_active(&self) -> bool {
        self.status == EpochStatus::Active
    }

    /// The record that succeeds this one.
    pub fn successor(&self, created_at: DateTime<Utc>) -> Epoch {
        Epoch::new(self.id + 1, created_at)
    }
}

/// Archived statistics of a closed epoch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EpochStats {
    /// Layout version of this record
    pub schema_version: u32,

    /// Aggregated statistics
    pub aggregate: EpochAggregate,

    /// Prose rendering of the aggregate
    pub narrative: Narrative,

    /// Who produced the narrative
    pub narrative_source: NarrativeSource,
}

impl EpochStats {
    pub fn new(aggregate: EpochAggregate, narrative: Narrative, source: NarrativeSource) -> Self {
        Self {
            schema_version: STATS_SCHEMA_VERSION,
            aggregate,
            narrative,
            narrative_source: source,
        }
    }
}

/// Running counters of an epoch, updated in the same write as every append.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EpochCounters {
    /// Messages appended
    pub total: u64,

    /// Distinct normalized texts
    pub unique: u64,

    /// Messages per layer
    #[serde(default)]
    pub per_layer: BTreeMap<LayerIndex, u64>,

    /// Messages per room, per layer
    #[serde(default)]
    pub per_room: BTreeMap<LayerIndex, BTreeMap<RoomIndex, u64>>,
}

impl EpochCounters {
    /// Messages already placed in `layer`.
    pub fn in_layer(&self, layer: LayerIndex) -> u64 {
        self.per_layer.get(&layer).copied().unwrap_or(0)
    }

    /// Messages already placed in a room.
    pub fn in_room(&self, layer: LayerIndex, room: RoomIndex) -> u64 {
        self.per_room
            .get(&layer)
            .and_then(|rooms| rooms.get(&room))
            .copied()
            .unwrap_or(0)
    }

    /// Rooms of `layer` holding at least one message.
    pub fn active_rooms(&self, layer: LayerIndex) -> usize {
        self.per_room
            .get(&layer)
            .map(|rooms| rooms.values().filter(|n| **n > 0).count())
            .unwrap_or(0)
    }

    /// Echoes so far: messages whose text was already present.
    pub fn echoes(&self) -> u64 {
        self.total.saturating_sub(self.unique)
    }

    /// Account for one appended message.
    pub fn record(&mut self, placement: Placement, first_of_text: bool) {
        self.total += 1;
        if first_of_text {
            self.unique += 1;
        }
        *self.per_layer.entry(placement.layer).or_default() += 1;
        *self
            .per_room
            .entry(placement.layer)
            .or_default()
            .entry(placement.room)
            .or_default() += 1;
    }
}
