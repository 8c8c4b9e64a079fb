//! Epoch lifecycle.
//!
//! ```text
//! ACTIVE ──claim──▶ CLOSING ──complete──▶ CLOSED
//!                                          │
//!                               successor ACTIVE (id + 1)
//! ```
//!
//! A closure is claimed by an atomic status change in the store: either the
//! append that reaches the threshold flips the epoch to closing in its own
//! transaction, or [`EpochMachine::close_on_threshold`] /
//! [`EpochMachine::close_with_narrative`] compare-and-swap it. The claimant
//! aggregates, narrates and completes; completion is itself a
//! compare-and-swap, so exactly one successor is ever created.
//!
//! A closure interrupted by a crash or failure leaves the epoch closing.
//! [`EpochMachine::resume_pending_closure`] finishes it.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::events::{emit, EventSender, LibraryEvent};
use crate::models::{Epoch, EpochAggregate, EpochId, EpochStats, EpochStatus, Narrative, NarrativeSource};
use crate::narrative::Narrator;
use crate::stats::Aggregator;
use crate::storage::{ClosureClaim, ClosureCompletion, Store};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// What a closure attempt achieved.
#[derive(Debug, Clone)]
pub enum ClosureOutcome {
    /// This call closed the epoch.
    Closed { closed: Epoch, successor: Epoch },
    /// Another caller is closing it.
    InProgress,
    /// It was already closed.
    AlreadyClosed,
    /// The threshold has not been reached.
    BelowThreshold { total: u64, threshold: u64 },
    /// No such epoch.
    NotFound,
}

/// Removes an epoch from the in-flight set when the closure ends.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<EpochId>>,
    id: EpochId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

/// Drives epochs through their lifecycle.
pub struct EpochMachine {
    store: Arc<dyn Store>,
    aggregator: Aggregator,
    narrator: Arc<Narrator>,
    clock: Arc<dyn Clock>,
    threshold: u64,
    events: EventSender,
    in_flight: Mutex<HashSet<EpochId>>,
}

impl EpochMachine {
    pub fn new(
        store: Arc<dyn Store>,
        aggregator: Aggregator,
        narrator: Arc<Narrator>,
        clock: Arc<dyn Clock>,
        threshold: u64,
        events: EventSender,
    ) -> Self {
        Self {
            store,
            aggregator,
            narrator,
            clock,
            threshold,
            events,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Closure threshold.
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Ensure a current epoch exists.
    pub fn bootstrap(&self) -> Result<Epoch> {
        self.store.bootstrap(self.clock.now())
    }

    /// The current epoch. Its absence is an invariant violation.
    pub fn current(&self) -> Result<Epoch> {
        self.store.current_epoch()?.ok_or_else(|| {
            tracing::error!("No current epoch");
            Error::Invariant("no current epoch".into())
        })
    }

    /// Aggregate the messages of `epoch` as they are now.
    pub async fn aggregate(&self, epoch: &Epoch) -> Result<EpochAggregate> {
        let store = Arc::clone(&self.store);
        let aggregator = self.aggregator.clone();
        let epoch = epoch.clone();
        tokio::task::spawn_blocking(move || -> Result<EpochAggregate> {
            let mut accumulator = aggregator.begin(&epoch);
            store.for_each_message(epoch.id, &mut |message| {
                accumulator.push(&message);
                Ok(())
            })?;
            Ok(accumulator.finish(None))
        })
        .await
        .map_err(|e| Error::Invariant(format!("aggregation task failed: {}", e)))?
    }

    /// Close `id` if it has reached the threshold. Safe to call concurrently.
    pub async fn close_on_threshold(&self, id: EpochId) -> Result<ClosureOutcome> {
        let total = self.store.counters(id)?.total;
        if total < self.threshold {
            return Ok(ClosureOutcome::BelowThreshold {
                total,
                threshold: self.threshold,
            });
        }
        match self.store.claim_closure(id)? {
            ClosureClaim::Claimed(epoch) => self.finish(epoch, None).await,
            ClosureClaim::AlreadyClosing(epoch) => self.resume_orphan(epoch, None).await,
            ClosureClaim::AlreadyClosed(_) => Ok(ClosureOutcome::AlreadyClosed),
            ClosureClaim::NotFound => Ok(ClosureOutcome::NotFound),
        }
    }

    /// Close `id` with an administrator's narrative, regardless of its size.
    pub async fn close_with_narrative(
        &self,
        id: EpochId,
        narrative: Narrative,
        by: String,
    ) -> Result<ClosureOutcome> {
        let manual = Some((narrative, NarrativeSource::Manual { by }));
        match self.store.claim_closure(id)? {
            ClosureClaim::Claimed(epoch) => self.finish(epoch, manual).await,
            ClosureClaim::AlreadyClosing(epoch) => self.resume_orphan(epoch, manual).await,
            ClosureClaim::AlreadyClosed(_) => Ok(ClosureOutcome::AlreadyClosed),
            ClosureClaim::NotFound => Ok(ClosureOutcome::NotFound),
        }
    }

    /// Finish a closure the caller already claimed through an append.
    pub async fn finish_claimed(&self, id: EpochId) -> Result<ClosureOutcome> {
        match self.store.get_epoch(id)? {
            Some(epoch) => self.finish(epoch, None).await,
            None => Ok(ClosureOutcome::NotFound),
        }
    }

    /// Finish a closure left behind by a crash or failure, or close an
    /// epoch that sits at the threshold without having been claimed.
    pub async fn resume_pending_closure(&self) -> Result<Option<ClosureOutcome>> {
        let Some(epoch) = self.store.current_epoch()? else {
            return Ok(None);
        };
        match epoch.status {
            EpochStatus::Closing => {
                tracing::info!("Resuming interrupted closure of {}", epoch.name);
                Ok(Some(self.resume_orphan(epoch, None).await?))
            }
            EpochStatus::Active if self.store.counters(epoch.id)?.total >= self.threshold => {
                tracing::info!("{} is at the threshold, closing", epoch.name);
                Ok(Some(self.close_on_threshold(epoch.id).await?))
            }
            _ => Ok(None),
        }
    }

    /// Whether this process is currently closing `id`.
    pub fn is_closing(&self, id: EpochId) -> bool {
        self.in_flight.lock().contains(&id)
    }

    async fn resume_orphan(
        &self,
        epoch: Epoch,
        manual: Option<(Narrative, NarrativeSource)>,
    ) -> Result<ClosureOutcome> {
        if self.is_closing(epoch.id) {
            return Ok(ClosureOutcome::InProgress);
        }
        self.finish(epoch, manual).await
    }

    async fn finish(
        &self,
        epoch: Epoch,
        manual: Option<(Narrative, NarrativeSource)>,
    ) -> Result<ClosureOutcome> {
        if !self.in_flight.lock().insert(epoch.id) {
            return Ok(ClosureOutcome::InProgress);
        }
        let _in_flight = InFlight {
            set: &self.in_flight,
            id: epoch.id,
        };

        // another closer may have completed between the claim and here
        match self.store.get_epoch(epoch.id)? {
            Some(current) if current.status == EpochStatus::Closing => {}
            Some(_) => return Ok(ClosureOutcome::AlreadyClosed),
            None => return Ok(ClosureOutcome::NotFound),
        }

        tracing::info!("Closing {}", epoch.name);
        emit(
            &self.events,
            LibraryEvent::EpochClosing {
                epoch_id: epoch.id,
                name: epoch.name.clone(),
            },
        );

        let aggregate = self.aggregate(&epoch).await?;
        let (narrative, source) = match manual {
            Some(manual) => manual,
            None => self.narrator.narrate(&aggregate).await,
        };
        let total_messages = aggregate.total_messages;
        let stats = EpochStats::new(aggregate, narrative, source.clone());

        match self
            .store
            .complete_closure(epoch.id, stats, self.clock.now())?
        {
            ClosureCompletion::Completed { closed, successor } => {
                tracing::info!(
                    messages = total_messages,
                    "{} closed, {} is open",
                    closed.name,
                    successor.name
                );
                emit(
                    &self.events,
                    LibraryEvent::EpochClosed {
                        epoch_id: closed.id,
                        name: closed.name.clone(),
                        total_messages,
                        narrative_source: source,
                        successor_id: successor.id,
                        successor_name: successor.name.clone(),
                    },
                );
                Ok(ClosureOutcome::Closed { closed, successor })
            }
            ClosureCompletion::NotClosing(epoch) if epoch.status == EpochStatus::Closed => {
                Ok(ClosureOutcome::AlreadyClosed)
            }
            ClosureCompletion::NotClosing(epoch) => Err(Error::Invariant(format!(
                "{} left closing state without being closed",
                epoch.name
            ))),
            ClosureCompletion::NotFound => Ok(ClosureOutcome::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events;
    use crate::models::MessageDraft;
    use crate::stats::AggregatorConfig;
    use crate::storage::{AppendOutcome, AppendRequest, MemoryStore};
    use chrono::Utc;
    use echoes_layers::LayerTable;

    struct Fixture {
        store: Arc<MemoryStore>,
        machine: Arc<EpochMachine>,
        events: EventSender,
    }

    fn fixture(threshold: u64) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::in_memory());
        let layers = Arc::new(LayerTable::standard());
        let events = events::channel();
        let machine = Arc::new(EpochMachine::new(
            store.clone(),
            Aggregator::new(AggregatorConfig::default(), layers),
            Arc::new(Narrator::template_only()),
            clock,
            threshold,
            events.clone(),
        ));
        machine.bootstrap().unwrap();
        Fixture {
            store,
            machine,
            events,
        }
    }

    fn fill(store: &MemoryStore, n: usize) {
        let layers = LayerTable::standard();
        for i in 0..n {
            let outcome = store
                .append_message(
                    &MessageDraft::new(&format!("message number {}", i), Utc::now()),
                    AppendRequest {
                        layers: &layers,
                        threshold: u64::MAX,
                        quota: None,
                    },
                )
                .unwrap();
            assert!(matches!(outcome, AppendOutcome::Appended(_)));
        }
    }

    fn manual_narrative() -> Narrative {
        Narrative {
            short_summary: "short".into(),
            detailed_manifesto: "long".into(),
            emotional_tone: "calm".into(),
            key_themes: vec!["calm".into()],
            metaphor: None,
            closing_verse: None,
        }
    }

    #[tokio::test]
    async fn below_threshold_does_nothing() {
        let f = fixture(5);
        fill(&f.store, 4);
        assert!(matches!(
            f.machine.close_on_threshold(1).await.unwrap(),
            ClosureOutcome::BelowThreshold { total: 4, threshold: 5 }
        ));
        assert!(f.machine.current().unwrap().is_active());
    }

    #[tokio::test]
    async fn threshold_closure_archives_stats_and_opens_successor() {
        let f = fixture(3);
        fill(&f.store, 3);
        let mut rx = f.events.subscribe();

        let ClosureOutcome::Closed { closed, successor } = f.machine.close_on_threshold(1).await.unwrap()
        else {
            panic!("expected closure");
        };
        assert_eq!(closed.status, EpochStatus::Closed);
        let stats = closed.stats.unwrap();
        assert_eq!(stats.aggregate.total_messages, 3);
        assert_eq!(stats.narrative_source, NarrativeSource::Fallback);
        assert_eq!(successor.name, "Age 2");
        assert_eq!(f.machine.current().unwrap().id, 2);

        assert!(matches!(rx.recv().await.unwrap(), LibraryEvent::EpochClosing { epoch_id: 1, .. }));
        assert!(matches!(rx.recv().await.unwrap(), LibraryEvent::EpochClosed { successor_id: 2, .. }));

        assert!(matches!(
            f.machine.close_on_threshold(1).await.unwrap(),
            ClosureOutcome::AlreadyClosed
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_attempts_close_exactly_once() {
        let f = fixture(3);
        fill(&f.store, 3);

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let machine = Arc::clone(&f.machine);
                tokio::spawn(async move { machine.close_on_threshold(1).await })
            })
            .collect();

        let mut closed = 0;
        for attempt in futures::future::join_all(attempts).await {
            if let ClosureOutcome::Closed { .. } = attempt.unwrap().unwrap() {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);

        let epochs = f.store.list_epochs().unwrap();
        assert_eq!(epochs.len(), 2);
        assert_eq!(epochs.iter().filter(|e| e.is_active()).count(), 1);
        assert_eq!(epochs.iter().filter(|e| e.status == EpochStatus::Closed).count(), 1);
    }

    #[tokio::test]
    async fn manual_narrative_closes_small_epoch() {
        let f = fixture(1_000);
        fill(&f.store, 2);

        let ClosureOutcome::Closed { closed, .. } = f
            .machine
            .close_with_narrative(1, manual_narrative(), "ab12".into())
            .await
            .unwrap()
        else {
            panic!("expected closure");
        };
        let stats = closed.stats.unwrap();
        assert_eq!(stats.narrative, manual_narrative());
        assert_eq!(stats.narrative_source, NarrativeSource::Manual { by: "ab12".into() });
        assert_eq!(stats.aggregate.total_messages, 2);

        assert!(matches!(
            f.machine
                .close_with_narrative(1, manual_narrative(), "ab12".into())
                .await
                .unwrap(),
            ClosureOutcome::AlreadyClosed
        ));
    }

    #[tokio::test]
    async fn interrupted_closure_is_resumed() {
        let f = fixture(1_000);
        fill(&f.store, 2);
        // claimed but never completed, as after a crash
        assert!(matches!(f.store.claim_closure(1).unwrap(), ClosureClaim::Claimed(_)));

        let outcome = f.machine.resume_pending_closure().await.unwrap();
        assert!(matches!(outcome, Some(ClosureOutcome::Closed { .. })));
        assert_eq!(f.machine.current().unwrap().id, 2);
        assert!(f.machine.resume_pending_closure().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn aggregate_is_idempotent_on_closed_epoch() {
        let f = fixture(3);
        fill(&f.store, 3);
        f.machine.close_on_threshold(1).await.unwrap();

        let closed = f.store.get_epoch(1).unwrap().unwrap();
        let again = f.machine.aggregate(&closed).await.unwrap();
        let stored = closed.stats.unwrap().aggregate;
        assert_eq!(
            serde_json::to_vec(&again).unwrap(),
            serde_json::to_vec(&stored).unwrap()
        );
    }
}
