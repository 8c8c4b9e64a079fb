//! WebSocket stream of library events.
//!
//! Connect to `/api/v1/ws/events`. The first frame is a snapshot of the
//! current epoch:
//!
//! ```json
//! {"type": "snapshot", "state": {"epochName": "Age 1", "totalMessages": 42, ...}}
//! ```
//!
//! followed by every [`LibraryEvent`] as it happens, and a heartbeat every
//! 30 seconds while the stream is idle.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::events::LibraryEvent;
use crate::library::{Library, SystemState};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Initial frame of a stream.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamHeader {
    Snapshot { state: SystemState },
}

/// WebSocket upgrade handler for library events.
pub async fn ws_events_handler(
    ws: WebSocketUpgrade,
    State(library): State<Arc<Library>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, library))
}

async fn handle_socket(mut socket: WebSocket, library: Arc<Library>) {
    info!("WebSocket client connected");
    let mut events = library.subscribe();

    match library.system_state() {
        Ok(state) => {
            if let Err(e) = send_json(&mut socket, &StreamHeader::Snapshot { state }).await {
                warn!("Failed to send initial snapshot: {}", e);
                return;
            }
        }
        Err(e) => warn!("No snapshot for new subscriber: {}", e),
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received from client: {}", text);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = socket.send(Message::Pong(data)).await {
                            warn!("Failed to send pong: {}", e);
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if let Err(e) = send_json(&mut socket, &event).await {
                            warn!("Failed to send event: {}", e);
                            break;
                        }
                        heartbeat.reset();
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "WebSocket subscriber lagging, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = heartbeat.tick() => {
                let beat = LibraryEvent::Heartbeat {
                    timestamp: chrono::Utc::now().timestamp(),
                };
                if let Err(e) = send_json(&mut socket, &beat).await {
                    warn!("Failed to send heartbeat: {}", e);
                    break;
                }
            }
        }
    }
}

/// Send a JSON text frame.
async fn send_json<T: Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), axum::Error> {
    let json = serde_json::to_string(value).map_err(axum::Error::new)?;
    socket.send(Message::Text(json)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use echoes_layers::LayerIndex;
    use crate::models::EpochStatus;

    #[test]
    fn snapshot_frame_is_tagged() {
        let header = StreamHeader::Snapshot {
            state: SystemState {
                epoch_id: 1,
                epoch_name: "Age 1".into(),
                status: EpochStatus::Active,
                layer_index: LayerIndex(1),
                layer_name: "Threshold".into(),
                total_messages: 0,
                threshold: 5,
                layer_progress: 0.0,
                threshold_reached: false,
            },
        };
        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json["type"], "snapshot");
        assert_eq!(json["state"]["epochName"], "Age 1");
        assert_eq!(json["state"]["status"], "active");
    }
}
