//! Data models for the Echoes node.
//!
//! # Core Types
//!
//! - [`Epoch`] - A bounded era of collection and its lifecycle state
//! - [`Message`] - An immutable, placed submission
//! - [`RateLimitRecord`] - Per-identifier daily consumption
//!
//! # Closure Types
//!
//! - [`EpochAggregate`] - Statistics over an epoch's messages
//! - [`Narrative`] - Prose attached to a closed epoch
//! - [`EpochStats`] - Version-tagged archive of both
//! - [`LayerMoment`] - Snapshot taken when an epoch reaches a layer

mod aggregate;
mod epoch;
mod message;
mod moment;
mod narrative;
mod quota;

pub use aggregate::{
    EmotionBreakdown, EpochAggregate, LayerOccupancy, PunctuationStats, RoomOccupancy,
    SentenceCount, TemporalStats, WordCount,
};
pub use epoch::{Epoch, EpochCounters, EpochId, EpochStats, EpochStatus, STATS_SCHEMA_VERSION};
pub use message::{Message, MessageDraft};
pub use moment::{LayerComparison, LayerMoment};
pub use narrative::{Narrative, NarrativeDraft, NarrativeSource};
pub use quota::{QuotaClaim, RateLimitRecord};
