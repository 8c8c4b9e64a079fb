//! Aggregate model - the statistics computed over a message set.

use super::epoch::EpochId;
use chrono::{DateTime, Utc};
use echoes_layers::{LayerIndex, RoomIndex};
use serde::{Deserialize, Serialize};

/// Statistics over every message of one epoch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EpochAggregate {
    pub epoch_id: EpochId,
    pub epoch_name: String,

    /// Messages in the epoch
    pub total_messages: u64,

    /// Distinct normalized texts
    pub unique_messages: u64,

    /// `total - unique`
    pub echo_count: u64,

    /// `unique / total`, 0 for an empty epoch
    pub diversity: f64,

    /// Most frequent words, highest first
    pub top_words: Vec<WordCount>,

    /// Most repeated sentences, highest first
    pub top_sentences: Vec<SentenceCount>,

    pub temporal: TemporalStats,
    pub punctuation: PunctuationStats,
    pub emotions: EmotionBreakdown,

    /// Occupancy of every layer that received messages
    pub layers: Vec<LayerOccupancy>,

    /// Layer of the last message
    pub final_layer: LayerIndex,
    pub final_layer_name: String,

    /// Days between the epoch opening and its last message
    pub duration_days: i64,

    pub first_message_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// A word and its frequency.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WordCount {
    pub word: String,
    pub count: u64,
}

/// A repeated sentence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SentenceCount {
    /// First original rendering
    pub text: String,

    /// Shared canonical form
    pub normalized_text: String,

    pub count: u64,
}

/// When messages were written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemporalStats {
    /// Offset the histograms were computed in
    pub utc_offset_minutes: i32,

    /// Messages per hour of day
    pub hours: [u64; 24],

    /// Messages per weekday, Monday first
    pub weekdays: [u64; 7],

    /// Busiest hour, earliest on ties
    pub peak_hour: Option<u32>,

    /// Busiest weekday (0 = Monday), earliest on ties
    pub peak_weekday: Option<u32>,

    /// Share written 18:00 to 05:59
    pub night_ratio: f64,

    /// Share written on Saturday or Sunday
    pub weekend_ratio: f64,
}

/// Punctuation habits.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PunctuationStats {
    /// Messages containing `?`
    pub questions: u64,

    /// Messages containing `!`
    pub exclamations: u64,
}

/// Keyword-lexicon mood counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EmotionBreakdown {
    pub melancholy: u64,
    pub hope: u64,
    pub joy: u64,
    pub nihilism: u64,

    /// Messages matching no lexicon
    pub neutral: u64,
}

impl EmotionBreakdown {
    /// Strongest mood among the lexicons, `None` when nothing matched.
    pub fn dominant(&self) -> Option<&'static str> {
        let moods = [
            ("melancholy", self.melancholy),
            ("hope", self.hope),
            ("joy", self.joy),
            ("nihilism", self.nihilism),
        ];
        let mut best: Option<(&'static str, u64)> = None;
        for (name, count) in moods {
            if count > 0 && best.map_or(true, |(_, top)| count > top) {
                best = Some((name, count));
            }
        }
        best.map(|(name, _)| name)
    }
}

/// Messages per layer and room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LayerOccupancy {
    pub layer: LayerIndex,
    pub name: String,
    pub messages: u64,
    pub rooms: Vec<RoomOccupancy>,
}

/// Messages in one room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomOccupancy {
    pub room: RoomIndex,
    pub messages: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dominant_prefers_earlier_mood_on_ties() {
        let emotions = EmotionBreakdown {
            melancholy: 3,
            hope: 3,
            joy: 1,
            nihilism: 0,
            neutral: 10,
        };
        assert_eq!(emotions.dominant(), Some("melancholy"));
        assert_eq!(EmotionBreakdown::default().dominant(), None);
    }
}
