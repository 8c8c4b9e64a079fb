//! Epoch statistics.
//!
//! The aggregator folds an ordered message set into an [`EpochAggregate`].
//! It is read-only and deterministic: every map is ordered and every ranking
//! breaks ties explicitly, so aggregating the same messages twice produces
//! byte-identical JSON.

use crate::models::{
    EmotionBreakdown, Epoch, EpochAggregate, LayerOccupancy, Message, PunctuationStats,
    RoomOccupancy, SentenceCount, TemporalStats, WordCount,
};
use chrono::{DateTime, Datelike, FixedOffset, Offset, Timelike, Utc};
use echoes_layers::{LayerIndex, LayerTable, RoomIndex};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Words dropped by the standard filter.
const STOP_WORDS: &[&str] = &[
    // Turkish
    "bir", "bu", "şu", "o", "ve", "ile", "için", "gibi", "kadar", "daha", "çok", "var", "yok",
    "mi", "mı", "mu", "mü", "da", "de", "ta", "te", "ki", "ne", "ya", "ama", "fakat", "veya",
    "hem", "her", "hiç", "tüm", "bazı", "birkaç", "şey", "zaman", "yer", "insan", "kişi",
    "şekilde", "olarak", "bana", "sana", "ona", "bunu", "şunu", "onun", "bunun", "şunun",
    "benim", "senin", "onların", "bizim", "sizin", "ben", "sen", "biz", "siz", "onlar", "neden",
    "nasıl", "nerede", "kim", "hangi", "kaç", "ise", "ancak", "hatta", "yani", "işte", "böyle",
    "şöyle", "artık", "sadece", "bile", "belki", "acaba", "demek", "yoksa",
    // English
    "the", "a", "an", "and", "or", "but", "not", "yes", "no", "can", "will", "what", "when",
    "where", "in", "on", "at", "to", "for", "is", "was", "are", "were", "be", "been", "i",
    "you", "he", "she", "this", "that", "with", "have", "from", "they", "there", "their",
    "just", "like", "about", "would", "could",
];

/// Keyword lexicons for mood counting. A message counts once per mood it mentions.
const MELANCHOLY: &[&str] = &[
    "üzgün", "sad", "yalnız", "alone", "lonely", "sessiz", "silence", "karanlık", "dark", "miss",
];
const HOPE: &[&str] = &[
    "umut", "hope", "gelecek", "future", "iyi", "good", "güzel", "beautiful", "tomorrow",
];
const JOY: &[&str] = &["mutlu", "happy", "sevinç", "joy", "gülümseme", "smile", "laugh"];
const NIHILISM: &[&str] = &[
    "boş", "empty", "anlamsız", "meaningless", "yokluk", "void", "nothing",
];

/// Which words count toward the top-word ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordFilter {
    /// Shortest counted word, in characters
    pub min_length: usize,

    /// Drop [`STOP_WORDS`]
    pub remove_stop_words: bool,

    /// Drop words made only of digits
    pub remove_numbers: bool,

    /// Words seen fewer times are not ranked
    pub min_frequency: u64,
}

impl WordFilter {
    /// Filter for epochs that grew past the first layer.
    pub fn standard() -> Self {
        Self {
            min_length: 4,
            remove_stop_words: true,
            remove_numbers: true,
            min_frequency: 2,
        }
    }

    /// Filter for small epochs that never left the first layer.
    pub fn light() -> Self {
        Self {
            min_length: 4,
            remove_stop_words: false,
            remove_numbers: true,
            min_frequency: 1,
        }
    }

    /// Filter suited to an epoch whose last message landed in `layer`.
    pub fn for_layer(layer: LayerIndex) -> Self {
        if layer <= LayerIndex(1) {
            Self::light()
        } else {
            Self::standard()
        }
    }

    fn accepts(&self, word: &str) -> bool {
        word.chars().count() >= self.min_length
            && !(self.remove_stop_words && STOP_WORDS.contains(&word))
            && !(self.remove_numbers && word.chars().all(|c| c.is_ascii_digit()))
    }
}

/// Aggregator tuning.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Words in the ranking
    pub top_words: usize,

    /// Sentences in the ranking
    pub top_sentences: usize,

    /// Offset used for hour and weekday histograms
    pub utc_offset_minutes: i32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            top_words: 20,
            top_sentences: 10,
            utc_offset_minutes: 0,
        }
    }
}

/// Builds [`EpochAggregate`]s.
#[derive(Debug, Clone)]
pub struct Aggregator {
    config: AggregatorConfig,
    layers: Arc<LayerTable>,
    offset: FixedOffset,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig, layers: Arc<LayerTable>) -> Self {
        let offset = FixedOffset::east_opt(config.utc_offset_minutes * 60).unwrap_or(Utc.fix());
        Self {
            config,
            layers,
            offset,
        }
    }

    /// Start folding messages of `epoch`.
    pub fn begin(&self, epoch: &Epoch) -> Accumulator {
        Accumulator {
            aggregator: self.clone(),
            epoch_id: epoch.id,
            epoch_name: epoch.name.clone(),
            created_at: epoch.created_at,
            total: 0,
            words: BTreeMap::new(),
            sentences: BTreeMap::new(),
            hours: [0; 24],
            weekdays: [0; 7],
            night: 0,
            weekend: 0,
            punctuation: PunctuationStats::default(),
            emotions: EmotionBreakdown::default(),
            rooms: BTreeMap::new(),
            first_at: None,
            last_at: None,
            last_layer: None,
        }
    }

    /// Aggregate a complete message set, choosing the word filter by final layer.
    pub fn aggregate(&self, epoch: &Epoch, messages: &[Message]) -> EpochAggregate {
        let mut accumulator = self.begin(epoch);
        for message in messages {
            accumulator.push(message);
        }
        accumulator.finish(None)
    }
}

#[derive(Clone)]
struct SentenceEntry {
    count: u64,
    first_sequence: u64,
    first_text: String,
}

/// Running state of one aggregation. Cloning it freezes a prefix.
#[derive(Clone)]
pub struct Accumulator {
    aggregator: Aggregator,
    epoch_id: u64,
    epoch_name: String,
    created_at: DateTime<Utc>,
    total: u64,
    words: BTreeMap<String, u64>,
    sentences: BTreeMap<String, SentenceEntry>,
    hours: [u64; 24],
    weekdays: [u64; 7],
    night: u64,
    weekend: u64,
    punctuation: PunctuationStats,
    emotions: EmotionBreakdown,
    rooms: BTreeMap<LayerIndex, BTreeMap<RoomIndex, u64>>,
    first_at: Option<DateTime<Utc>>,
    last_at: Option<DateTime<Utc>>,
    last_layer: Option<LayerIndex>,
}

impl Accumulator {
    /// Fold in the next message. Messages must arrive in sequence order.
    pub fn push(&mut self, message: &Message) {
        self.total += 1;

        for word in message.normalized_text.split_whitespace() {
            *self.words.entry(word.to_string()).or_default() += 1;
        }

        self.sentences
            .entry(message.normalized_text.clone())
            .and_modify(|entry| entry.count += 1)
            .or_insert_with(|| SentenceEntry {
                count: 1,
                first_sequence: message.sequence,
                first_text: message.text.clone(),
            });

        let local = message.created_at.with_timezone(&self.aggregator.offset);
        let hour = local.hour() as usize;
        let weekday = local.weekday().num_days_from_monday() as usize;
        self.hours[hour] += 1;
        self.weekdays[weekday] += 1;
        if hour >= 18 || hour < 6 {
            self.night += 1;
        }
        if weekday >= 5 {
            self.weekend += 1;
        }

        if message.text.contains('?') {
            self.punctuation.questions += 1;
        }
        if message.text.contains('!') {
            self.punctuation.exclamations += 1;
        }

        self.count_emotions(&message.text.to_lowercase());

        *self
            .rooms
            .entry(message.layer_index)
            .or_default()
            .entry(message.room_index)
            .or_default() += 1;

        self.first_at.get_or_insert(message.created_at);
        self.last_at = Some(message.created_at);
        self.last_layer = Some(message.layer_index);
    }

    fn count_emotions(&mut self, lower: &str) {
        let mentions = |lexicon: &[&str]| lexicon.iter().any(|keyword| lower.contains(keyword));
        let mut matched = false;
        for (lexicon, slot) in [
            (MELANCHOLY, &mut self.emotions.melancholy),
            (HOPE, &mut self.emotions.hope),
            (JOY, &mut self.emotions.joy),
            (NIHILISM, &mut self.emotions.nihilism),
        ] {
            if mentions(lexicon) {
                *slot += 1;
                matched = true;
            }
        }
        if !matched {
            self.emotions.neutral += 1;
        }
    }

    /// Produce the aggregate. `filter` defaults to [`WordFilter::for_layer`]
    /// of the final layer.
    pub fn finish(self, filter: Option<WordFilter>) -> EpochAggregate {
        let config = &self.aggregator.config;
        let layers = &self.aggregator.layers;

        let final_layer = self.last_layer.unwrap_or(layers.first().index);
        let final_layer_name = layers
            .get(final_layer)
            .map(|layer| layer.name.clone())
            .unwrap_or_default();
        let filter = filter.unwrap_or_else(|| WordFilter::for_layer(final_layer));

        let mut top_words: Vec<WordCount> = self
            .words
            .into_iter()
            .filter(|(word, count)| *count >= filter.min_frequency && filter.accepts(word))
            .map(|(word, count)| WordCount { word, count })
            .collect();
        // highest count first, then alphabetical
        top_words.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.word.cmp(&b.word)));
        top_words.truncate(config.top_words);

        let unique = self.sentences.len() as u64;
        let mut repeated: Vec<(String, SentenceEntry)> = self
            .sentences
            .into_iter()
            .filter(|(_, entry)| entry.count > 1)
            .collect();
        // highest count first, then earliest
        repeated.sort_by(|(_, a), (_, b)| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.first_sequence.cmp(&b.first_sequence))
        });
        let top_sentences = repeated
            .into_iter()
            .take(config.top_sentences)
            .map(|(normalized_text, entry)| SentenceCount {
                text: entry.first_text,
                normalized_text,
                count: entry.count,
            })
            .collect();

        let occupancy = self
            .rooms
            .into_iter()
            .map(|(layer, rooms)| LayerOccupancy {
                layer,
                name: layers
                    .get(layer)
                    .map(|def| def.name.clone())
                    .unwrap_or_default(),
                messages: rooms.values().sum(),
                rooms: rooms
                    .into_iter()
                    .map(|(room, messages)| RoomOccupancy { room, messages })
                    .collect(),
            })
            .collect();

        let ratio = |part: u64| {
            if self.total == 0 {
                0.0
            } else {
                part as f64 / self.total as f64
            }
        };

        EpochAggregate {
            epoch_id: self.epoch_id,
            epoch_name: self.epoch_name,
            total_messages: self.total,
            unique_messages: unique,
            echo_count: self.total - unique,
            diversity: ratio(unique),
            top_words,
            top_sentences,
            temporal: TemporalStats {
                utc_offset_minutes: self.aggregator.offset.local_minus_utc() / 60,
                hours: self.hours,
                weekdays: self.weekdays,
                peak_hour: peak(&self.hours),
                peak_weekday: peak(&self.weekdays),
                night_ratio: ratio(self.night),
                weekend_ratio: ratio(self.weekend),
            },
            punctuation: self.punctuation,
            emotions: self.emotions,
            layers: occupancy,
            final_layer,
            final_layer_name,
            duration_days: self
                .last_at
                .map(|last| (last - self.created_at).num_days().max(0))
                .unwrap_or(0),
            first_message_at: self.first_at,
            last_message_at: self.last_at,
        }
    }
}

/// Index of the largest bucket, earliest on ties, `None` when all are empty.
fn peak(buckets: &[u64]) -> Option<u32> {
    let mut best: Option<(usize, u64)> = None;
    for (index, count) in buckets.iter().copied().enumerate() {
        if count > 0 && best.map_or(true, |(_, top)| count > top) {
            best = Some((index, count));
        }
    }
    best.map(|(index, _)| index as u32)
}
