//! WebSocket push hub.
//!
//! Clients subscribe to topics (`Spectrum`, `Levels`, `Waveform`,
//! `Queue`, `RadioState`) and receive JSON frames as the runtime
//! publishes. Subscribe/unsubscribe are idempotent; the connected-client
//! count is exposed as a gauge on the event bus.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::ws::{Message, WebSocket};
use crossbeam_channel::Receiver;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::events::{EngineEvent, EventBus};
use crate::orchestrator::Orchestrator;
use crate::viz::{VizUpdate, VisualizationService};

/// Push topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Spectrum,
    Levels,
    Waveform,
    Queue,
    RadioState,
}

impl Topic {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "Spectrum" => Some(Self::Spectrum),
            "Levels" => Some(Self::Levels),
            "Waveform" => Some(Self::Waveform),
            "Queue" => Some(Self::Queue),
            "RadioState" => Some(Self::RadioState),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Spectrum => "Spectrum",
            Self::Levels => "Levels",
            Self::Waveform => "Waveform",
            Self::Queue => "Queue",
            Self::RadioState => "RadioState",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClientCommand {
    action: String,
    topic: String,
}

/// The hub: bridges the synchronous event bus into async land and tracks
/// the client gauge.
pub struct PushHub {
    bus: Arc<EventBus>,
    clients: AtomicUsize,
    engine_events: broadcast::Sender<EngineEvent>,
}

impl PushHub {
    /// Create the hub and start the bus bridge thread.
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        let (engine_events, _) = broadcast::channel(256);
        let hub = Arc::new(Self {
            clients: AtomicUsize::new(0),
            engine_events: engine_events.clone(),
            bus: Arc::clone(&bus),
        });

        let rx: Receiver<EngineEvent> = bus.subscribe();
        std::thread::Builder::new()
            .name("push-bridge".to_string())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    // Only queue/radio changes matter to push clients;
                    // viz frames arrive on their own channel
                    if matches!(
                        event,
                        EngineEvent::QueueChanged { .. } | EngineEvent::RadioStateChanged { .. }
                    ) {
                        let _ = engine_events.send(event);
                    }
                }
            })
            .expect("failed to spawn push bridge");

        hub
    }

    pub fn connected_clients(&self) -> usize {
        self.clients.load(Ordering::Acquire)
    }

    fn client_connected(&self) {
        let count = self.clients.fetch_add(1, Ordering::AcqRel) + 1;
        self.bus.set_push_clients(count);
        tracing::info!(count, "push client connected");
    }

    fn client_disconnected(&self) {
        let count = self.clients.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        self.bus.set_push_clients(count);
        tracing::info!(count, "push client disconnected");
    }

    /// Serve one accepted websocket until it closes.
    pub async fn serve(
        self: Arc<Self>,
        socket: WebSocket,
        viz: Arc<VisualizationService>,
        orchestrator: Arc<Orchestrator>,
    ) {
        self.client_connected();
        let (mut sink, mut stream) = socket.split();
        let mut topics: HashSet<Topic> = HashSet::new();
        let mut viz_rx = viz.subscribe();
        let mut engine_rx = self.engine_events.subscribe();

        loop {
            tokio::select! {
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ClientCommand>(&text) {
                                Ok(command) => {
                                    let Some(topic) = Topic::parse(&command.topic) else {
                                        continue;
                                    };
                                    // Idempotent by construction
                                    match command.action.as_str() {
                                        "subscribe" => {
                                            topics.insert(topic);
                                        }
                                        "unsubscribe" => {
                                            topics.remove(&topic);
                                        }
                                        _ => {}
                                    }
                                }
                                Err(e) => tracing::debug!("bad push command: {e}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!("push socket error: {e}");
                            break;
                        }
                    }
                }
                update = viz_rx.recv() => {
                    let Ok(update) = update else { continue };
                    let frame = match update {
                        VizUpdate::Spectrum(s) if topics.contains(&Topic::Spectrum) => {
                            frame(Topic::Spectrum, &*s)
                        }
                        VizUpdate::Levels(l) if topics.contains(&Topic::Levels) => {
                            frame(Topic::Levels, &l)
                        }
                        VizUpdate::Waveform(w) if topics.contains(&Topic::Waveform) => {
                            frame(Topic::Waveform, &*w)
                        }
                        _ => None,
                    };
                    if let Some(frame) = frame {
                        if sink.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                }
                event = engine_rx.recv() => {
                    let Ok(event) = event else { continue };
                    let frame = match event {
                        EngineEvent::QueueChanged { .. } if topics.contains(&Topic::Queue) => {
                            orchestrator.queue().ok().and_then(|items| {
                                let dtos: Vec<crate::api::dto::QueueItemDto> =
                                    items.into_iter().map(Into::into).collect();
                                frame(Topic::Queue, &dtos)
                            })
                        }
                        EngineEvent::RadioStateChanged { .. }
                            if topics.contains(&Topic::RadioState) =>
                        {
                            orchestrator
                                .primary()
                                .and_then(|p| p.as_radio().map(|r| r.radio_state()))
                                .and_then(|state| frame(Topic::RadioState, &state))
                        }
                        _ => None,
                    };
                    if let Some(frame) = frame {
                        if sink.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        self.client_disconnected();
    }
}

fn frame<T: serde::Serialize>(topic: Topic, data: &T) -> Option<String> {
    serde_json::to_string(&serde_json::json!({
        "topic": topic.as_str(),
        "data": data,
    }))
    .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_parsing() {
        assert_eq!(Topic::parse("Spectrum"), Some(Topic::Spectrum));
        assert_eq!(Topic::parse("RadioState"), Some(Topic::RadioState));
        assert_eq!(Topic::parse("spectrum"), None);
    }

    #[test]
    fn test_frame_shape() {
        let frame = frame(Topic::Levels, &serde_json::json!({"peak": 0.5})).unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["topic"], "Levels");
        assert_eq!(value["data"]["peak"], 0.5);
    }

    #[tokio::test]
    async fn test_gauge_tracks_connections() {
        let bus = Arc::new(EventBus::new());
        let hub = PushHub::new(Arc::clone(&bus));
        hub.client_connected();
        hub.client_connected();
        assert_eq!(hub.connected_clients(), 2);
        assert_eq!(bus.push_clients(), 2);
        hub.client_disconnected();
        assert_eq!(hub.connected_clients(), 1);
    }
}
