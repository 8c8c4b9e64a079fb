//! Layer moments.
//!
//! When an epoch reaches a new layer the library takes a snapshot: the
//! statistics of the epoch so far, filtered the way that layer filters, how
//! much it grew since the end of every earlier layer, and a short narrative.
//! The first snapshot of each layer is stored with the epoch and served from
//! then on.

use crate::error::{Error, Result};
use crate::events::{emit, EventSender, LibraryEvent};
use crate::models::{Epoch, EpochAggregate, LayerComparison, LayerMoment, Message};
use crate::narrative::Narrator;
use crate::stats::{Accumulator, Aggregator, WordFilter};
use crate::storage::Store;
use chrono::{DateTime, Utc};
use echoes_layers::{LayerIndex, LayerTable};
use std::sync::Arc;

/// Statistics of an epoch at the layer its last message landed in.
#[derive(Debug, Clone)]
pub struct LayerSnapshot {
    pub layer: LayerIndex,
    pub reached_at: DateTime<Utc>,
    pub aggregate: EpochAggregate,
    pub comparisons: Vec<LayerComparison>,
}

/// Folds messages in sequence order, freezing an aggregate at the end of
/// every layer it passes.
pub struct LayerFold {
    layers: Arc<LayerTable>,
    accumulator: Accumulator,
    seen: u64,
    current: Option<(LayerIndex, DateTime<Utc>)>,
    completed: Vec<EpochAggregate>,
}

impl LayerFold {
    pub fn new(accumulator: Accumulator, layers: Arc<LayerTable>) -> Self {
        Self {
            layers,
            accumulator,
            seen: 0,
            current: None,
            completed: Vec::new(),
        }
    }

    pub fn push(&mut self, message: &Message) {
        self.accumulator.push(message);
        self.seen += 1;

        match self.current {
            Some((layer, _)) if layer == message.layer_index => {}
            _ => self.current = Some((message.layer_index, message.created_at)),
        }

        if let Some(layer) = self.layers.get(message.layer_index) {
            if layer.max_count == Some(self.seen) {
                let filter = WordFilter::for_layer(layer.index);
                self.completed
                    .push(self.accumulator.clone().finish(Some(filter)));
            }
        }
    }

    /// The snapshot, `None` when no message was pushed.
    pub fn finish(self) -> Option<LayerSnapshot> {
        let (layer, reached_at) = self.current?;
        let aggregate = self.accumulator.finish(Some(WordFilter::for_layer(layer)));
        let comparisons = self
            .completed
            .iter()
            .rev()
            .filter(|earlier| earlier.final_layer < layer)
            .map(|earlier| LayerComparison::between(earlier, &aggregate))
            .collect();
        Some(LayerSnapshot {
            layer,
            reached_at,
            aggregate,
            comparisons,
        })
    }
}

/// Captures and stores layer moments.
pub struct LayerMoments {
    store: Arc<dyn Store>,
    aggregator: Aggregator,
    layers: Arc<LayerTable>,
    narrator: Arc<Narrator>,
    events: EventSender,
}

impl LayerMoments {
    pub fn new(
        store: Arc<dyn Store>,
        aggregator: Aggregator,
        layers: Arc<LayerTable>,
        narrator: Arc<Narrator>,
        events: EventSender,
    ) -> Self {
        Self {
            store,
            aggregator,
            layers,
            narrator,
            events,
        }
    }

    /// Moment of the layer `epoch` is in, captured on first request.
    /// `None` while the epoch has no messages.
    pub async fn capture(&self, epoch: &Epoch) -> Result<Option<LayerMoment>> {
        let total = self.store.counters(epoch.id)?.total;
        let Some(last) = total.checked_sub(1) else {
            return Ok(None);
        };
        let layer = self.layers.layer_for(last).index;
        if let Some(stored) = self.store.layer_moment(epoch.id, layer)? {
            return Ok(Some(stored));
        }

        let Some(snapshot) = self.snapshot(epoch).await? else {
            return Ok(None);
        };
        // messages may have crossed into another layer during the scan
        if snapshot.layer != layer {
            if let Some(stored) = self.store.layer_moment(epoch.id, snapshot.layer)? {
                return Ok(Some(stored));
            }
        }

        let (narrative, narrative_source) = self.narrator.narrate_layer(&snapshot.aggregate).await;
        let moment = LayerMoment {
            epoch_id: epoch.id,
            epoch_name: epoch.name.clone(),
            layer: snapshot.layer,
            layer_name: snapshot.aggregate.final_layer_name.clone(),
            reached_at: snapshot.reached_at,
            aggregate: snapshot.aggregate,
            narrative,
            narrative_source,
            comparisons: snapshot.comparisons,
        };

        match self.store.record_layer_moment(&moment)? {
            Some(earlier) => Ok(Some(earlier)),
            None => {
                tracing::info!(
                    "Recorded layer moment of {} at {} ({} messages)",
                    moment.epoch_name,
                    moment.layer_name,
                    moment.aggregate.total_messages
                );
                emit(
                    &self.events,
                    LibraryEvent::LayerMomentRecorded {
                        epoch_id: moment.epoch_id,
                        layer: moment.layer,
                        layer_name: moment.layer_name.clone(),
                        short_summary: moment.narrative.short_summary.clone(),
                    },
                );
                Ok(Some(moment))
            }
        }
    }

    /// Stored moments of an epoch, lowest layer first.
    pub fn history(&self, epoch: &Epoch) -> Result<Vec<LayerMoment>> {
        self.store.layer_moments(epoch.id)
    }

    async fn snapshot(&self, epoch: &Epoch) -> Result<Option<LayerSnapshot>> {
        let store = Arc::clone(&self.store);
        let mut fold = LayerFold::new(self.aggregator.begin(epoch), Arc::clone(&self.layers));
        let epoch_id = epoch.id;
        tokio::task::spawn_blocking(move || -> Result<Option<LayerSnapshot>> {
            store.for_each_message(epoch_id, &mut |message| {
                fold.push(&message);
                Ok(())
            })?;
            Ok(fold.finish())
        })
        .await
        .map_err(|e| Error::Invariant(format!("layer snapshot task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageDraft;
    use crate::stats::AggregatorConfig;
    use chrono::{Duration, TimeZone};
    use echoes_layers::{LayerDefinition, RoomIndex};

    fn table() -> Arc<LayerTable> {
        Arc::new(
            LayerTable::new(vec![
                LayerDefinition::new(1, "Void", 0, Some(3), 2, 2),
                LayerDefinition::new(2, "Whisper", 3, Some(6), 2, 2),
                LayerDefinition::new(3, "Glitch", 6, None, 2, 2),
            ])
            .unwrap(),
        )
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, 8, 0, 0).unwrap()
    }

    fn messages(texts: &[&str]) -> Vec<Message> {
        let layers = table();
        texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let sequence = i as u64;
                let at = start() + Duration::minutes(i as i64);
                let draft = MessageDraft::new(text, at);
                Message {
                    id: Message::generate_id(1, sequence, &draft.normalized_text),
                    epoch_id: 1,
                    sequence,
                    layer_index: layers.layer_for(sequence).index,
                    room_index: RoomIndex(0),
                    text: draft.text,
                    normalized_text: draft.normalized_text,
                    created_at: at,
                }
            })
            .collect()
    }

    fn fold(texts: &[&str]) -> Option<LayerSnapshot> {
        let layers = table();
        let aggregator = Aggregator::new(AggregatorConfig::default(), Arc::clone(&layers));
        let mut fold = LayerFold::new(aggregator.begin(&Epoch::new(1, start())), layers);
        for message in messages(texts) {
            fold.push(&message);
        }
        fold.finish()
    }

    #[test]
    fn compares_against_every_earlier_layer() {
        let snapshot = fold(&[
            "silent rooms",
            "silent rooms",
            "distant thunder",
            "thunder rolls closer",
            "thunder rolls closer",
            "silent rooms",
            "morning light",
        ])
        .unwrap();

        assert_eq!(snapshot.layer, LayerIndex(3));
        assert_eq!(snapshot.reached_at, start() + Duration::minutes(6));
        assert_eq!(snapshot.aggregate.total_messages, 7);
        assert_eq!(snapshot.aggregate.unique_messages, 4);
        assert_eq!(snapshot.aggregate.final_layer_name, "Glitch");

        let compared: Vec<(u32, u64, u64, u64)> = snapshot
            .comparisons
            .iter()
            .map(|c| (c.compared_with.0, c.message_growth, c.unique_growth, c.echo_growth))
            .collect();
        // nearest layer first
        assert_eq!(compared, vec![(2, 1, 1, 0), (1, 4, 2, 2)]);
        assert_eq!(snapshot.comparisons[0].layer_name, "Whisper");
        assert!(snapshot.comparisons[0].new_top_words.is_empty());
        // the first layer ranked with the light filter, so only the new repeats are new
        assert_eq!(snapshot.comparisons[1].new_top_words, vec!["closer", "rolls"]);
    }

    #[test]
    fn first_layer_uses_the_light_filter_and_has_no_comparisons() {
        let snapshot = fold(&["distant thunder", "quiet harbour"]).unwrap();
        assert_eq!(snapshot.layer, LayerIndex(1));
        assert!(snapshot.comparisons.is_empty());
        let words: Vec<&str> = snapshot
            .aggregate
            .top_words
            .iter()
            .map(|w| w.word.as_str())
            .collect();
        assert_eq!(words, vec!["distant", "harbour", "quiet", "thunder"]);
    }

    #[test]
    fn layer_end_does_not_compare_with_itself() {
        let snapshot = fold(&["one more voice", "two more voices", "three more voices"]).unwrap();
        assert_eq!(snapshot.layer, LayerIndex(1));
        assert!(snapshot.comparisons.is_empty());
    }

    #[test]
    fn empty_epoch_has_no_snapshot() {
        assert!(fold(&[]).is_none());
    }
}
