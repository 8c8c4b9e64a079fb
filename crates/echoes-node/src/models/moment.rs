//! Layer moment model - the snapshot taken when an epoch reaches a layer.

use super::aggregate::EpochAggregate;
use super::epoch::EpochId;
use super::narrative::{Narrative, NarrativeSource};
use chrono::{DateTime, Utc};
use echoes_layers::LayerIndex;
use serde::{Deserialize, Serialize};

/// An epoch as it stood in one of its layers, stored once per layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LayerMoment {
    pub epoch_id: EpochId,
    pub epoch_name: String,

    /// Layer the epoch had reached
    pub layer: LayerIndex,
    pub layer_name: String,

    /// When the first message of the layer was written
    pub reached_at: DateTime<Utc>,

    /// Statistics of the epoch so far, filtered for this layer
    pub aggregate: EpochAggregate,

    /// Prose rendering of the moment
    pub narrative: Narrative,

    /// Who produced the narrative
    pub narrative_source: NarrativeSource,

    /// Growth since each earlier layer, nearest first
    pub comparisons: Vec<LayerComparison>,
}

/// Growth between the end of an earlier layer and the moment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LayerComparison {
    /// The earlier layer
    pub compared_with: LayerIndex,
    pub layer_name: String,

    pub message_growth: u64,
    pub unique_growth: u64,
    pub echo_growth: u64,

    /// Leading words of the moment absent from the earlier layer's leaders
    pub new_top_words: Vec<String>,
}

impl LayerComparison {
    /// Words compared on each side.
    pub const LEADING_WORDS: usize = 5;

    /// Compare the aggregate at the end of an earlier layer with the current one.
    pub fn between(earlier: &EpochAggregate, current: &EpochAggregate) -> Self {
        let earlier_leaders: Vec<&str> = earlier
            .top_words
            .iter()
            .take(Self::LEADING_WORDS)
            .map(|w| w.word.as_str())
            .collect();
        let new_top_words = current
            .top_words
            .iter()
            .take(Self::LEADING_WORDS)
            .filter(|w| !earlier_leaders.contains(&w.word.as_str()))
            .map(|w| w.word.clone())
            .collect();

        Self {
            compared_with: earlier.final_layer,
            layer_name: earlier.final_layer_name.clone(),
            message_growth: current.total_messages.saturating_sub(earlier.total_messages),
            unique_growth: current.unique_messages.saturating_sub(earlier.unique_messages),
            echo_growth: current.echo_count.saturating_sub(earlier.echo_count),
            new_top_words,
        }
    }
}
