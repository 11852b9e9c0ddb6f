//! Internal publish/subscribe bus for runtime events.
//!
//! Sources, outputs, the ducking engine and the stream server publish
//! here; the push hub and tests subscribe. Dispatch is synchronous in the
//! publishing task but never blocks it: each subscriber gets a bounded
//! channel and slow subscribers lose events rather than back-pressuring
//! the publisher (the mixer is upstream of some publishers).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::RwLock;

use crate::mixer::ducking::DuckingState;
use crate::outputs::OutputState;
use crate::source::SourceState;
use crate::source::queue::QueueChange;

/// Events carried by the bus.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A source moved between states
    StateChanged {
        source_id: String,
        previous: SourceState,
        new: SourceState,
        error: Option<String>,
    },
    /// A source's queue was mutated
    QueueChanged {
        source_id: String,
        change: QueueChange,
    },
    /// A source's metadata map changed (track change, identification overlay)
    MetadataChanged { source_id: String },
    /// Radio tuner state changed (frequency, band, scan, signal)
    RadioStateChanged { source_id: String },
    /// Duck level or active-event count changed
    DuckingChanged(DuckingState),
    /// An output moved between states
    OutputStateChanged {
        output_id: String,
        previous: OutputState,
        new: OutputState,
    },
    /// An HTTP stream client connected
    StreamClientConnected {
        client_id: String,
        remote: String,
    },
    /// An HTTP stream client disconnected
    StreamClientDisconnected { client_id: String },
}

/// Bounded per-subscriber capacity. Events beyond this are dropped for
/// that subscriber and counted.
const SUBSCRIBER_CAPACITY: usize = 256;

struct Subscriber {
    tx: Sender<EngineEvent>,
    dead: std::sync::atomic::AtomicBool,
}

/// The process-wide event bus.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    published: AtomicU64,
    dropped: AtomicU64,
    /// Connected push-hub clients, exposed as a gauge
    push_clients: AtomicUsize,
    /// Connected HTTP stream clients, exposed as a gauge
    stream_clients: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber and return its receiving end.
    ///
    /// Disconnected receivers are pruned lazily on the next publish.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = bounded(SUBSCRIBER_CAPACITY);
        self.subscribers.write().push(Subscriber {
            tx,
            dead: std::sync::atomic::AtomicBool::new(false),
        });
        rx
    }

    /// Publish an event to every live subscriber.
    pub fn publish(&self, event: EngineEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut any_dead = false;
        {
            let subs = self.subscribers.read();
            for sub in subs.iter() {
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(crossbeam_channel::TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                        sub.dead.store(true, Ordering::Relaxed);
                        any_dead = true;
                    }
                }
            }
        }

        if any_dead {
            self.subscribers
                .write()
                .retain(|s| !s.dead.load(Ordering::Relaxed));
        }
    }

    /// Total events published.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Events dropped because a subscriber was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Gauge: connected push-hub clients.
    pub fn set_push_clients(&self, n: usize) {
        self.push_clients.store(n, Ordering::Relaxed);
    }

    pub fn push_clients(&self) -> usize {
        self.push_clients.load(Ordering::Relaxed)
    }

    /// Gauge: connected HTTP stream clients.
    pub fn set_stream_clients(&self, n: usize) {
        self.stream_clients.store(n, Ordering::Relaxed);
    }

    pub fn stream_clients(&self) -> usize {
        self.stream_clients.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_event(id: &str) -> EngineEvent {
        EngineEvent::StateChanged {
            source_id: id.to_string(),
            previous: SourceState::Ready,
            new: SourceState::Playing,
            error: None,
        }
    }

    #[test]
    fn test_publish_reaches_subscriber() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        bus.publish(state_event("file"));
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, EngineEvent::StateChanged { new: SourceState::Playing, .. }));
    }

    #[test]
    fn test_full_subscriber_drops_not_blocks() {
        let bus = EventBus::new();
        let _rx = bus.subscribe();
        for _ in 0..(SUBSCRIBER_CAPACITY + 10) {
            bus.publish(state_event("file"));
        }
        assert_eq!(bus.dropped(), 10);
    }

    #[test]
    fn test_gauges() {
        let bus = EventBus::new();
        bus.set_push_clients(3);
        bus.set_stream_clients(1);
        assert_eq!(bus.push_clients(), 3);
        assert_eq!(bus.stream_clients(), 1);
    }
}
