//! Library events, broadcast to WebSocket subscribers.

use crate::models::{EpochId, NarrativeSource};
use echoes_layers::{LayerIndex, RoomIndex};
use serde::Serialize;
use tokio::sync::broadcast;

/// Events buffered per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 1024;

/// Something observable happened in the library.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum LibraryEvent {
    /// A message was placed
    MessagePlaced {
        epoch_id: EpochId,
        layer: LayerIndex,
        room: RoomIndex,
        total: u64,
        echo_count: u64,
    },
    /// The first message of a new layer was placed
    LayerReached {
        epoch_id: EpochId,
        layer: LayerIndex,
        name: String,
        total: u64,
    },
    /// The snapshot of a newly reached layer was stored
    LayerMomentRecorded {
        epoch_id: EpochId,
        layer: LayerIndex,
        layer_name: String,
        short_summary: String,
    },
    /// Closure started
    EpochClosing { epoch_id: EpochId, name: String },
    /// Closure finished and the successor is open
    EpochClosed {
        epoch_id: EpochId,
        name: String,
        total_messages: u64,
        narrative_source: NarrativeSource,
        successor_id: EpochId,
        successor_name: String,
    },
    /// Keeps idle connections alive
    Heartbeat { timestamp: i64 },
}

/// Sending half shared by everything that emits events.
pub type EventSender = broadcast::Sender<LibraryEvent>;

/// A new event channel with no subscribers.
pub fn channel() -> EventSender {
    broadcast::channel(EVENT_CAPACITY).0
}

/// Emit an event; having no subscribers is not an error.
pub fn emit(events: &EventSender, event: LibraryEvent) {
    let _ = events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged() {
        let json = serde_json::to_value(LibraryEvent::EpochClosing {
            epoch_id: 3,
            name: "Age 3".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "epoch_closing");
        assert_eq!(json["epochId"], 3);
    }

    #[test]
    fn event_fields_are_camel_case() {
        let json = serde_json::to_value(LibraryEvent::EpochClosed {
            epoch_id: 1,
            name: "Age 1".into(),
            total_messages: 5,
            narrative_source: NarrativeSource::Fallback,
            successor_id: 2,
            successor_name: "Age 2".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "epoch_closed");
        assert_eq!(json["totalMessages"], 5);
        assert_eq!(json["successorName"], "Age 2");
        assert!(json.get("successor_name").is_none());
    }

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let events = channel();
        emit(&events, LibraryEvent::Heartbeat { timestamp: 0 });
        let mut rx = events.subscribe();
        emit(&events, LibraryEvent::Heartbeat { timestamp: 1 });
        assert_eq!(rx.recv().await.unwrap(), LibraryEvent::Heartbeat { timestamp: 1 });
    }
}
