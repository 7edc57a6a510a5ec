//! Engine events.
//!
//! Worker threads publish notifications here instead of calling back into
//! application code. Publishing never blocks: when the bus is full the event
//! is dropped.

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

/// Notifications raised by the engine's worker threads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SoundEvent {
    /// A streaming source reached the end of its current sound.
    EndOfStream {
        /// Source name
        source: String,
        /// Sounds still waiting in the source's sequence
        queued: usize,
    },
    /// A source was removed, either explicitly or as a finished temporary.
    SourceRemoved {
        /// Source name
        source: String,
    },
    /// The engine moved to a different backend.
    BackendSwitched {
        /// Previous backend name
        from: String,
        /// New backend name
        to: String,
    },
}

/// Bounded, non-blocking event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: Sender<SoundEvent>,
    receiver: Receiver<SoundEvent>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    /// Create a bus holding at most `capacity` undelivered events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self {
            sender,
            receiver,
            capacity: capacity.max(1),
        }
    }

    /// Publish an event, dropping it if the bus is full.
    pub fn publish(&self, event: SoundEvent) {
        let _ = self.sender.try_send(event);
    }

    /// Drain all pending events.
    pub fn drain(&self) -> Vec<SoundEvent> {
        self.receiver.try_iter().collect()
    }

    /// Number of undelivered events.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }

    /// Channel capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Receiving end, for applications that want to block on events.
    #[must_use]
    pub fn receiver(&self) -> Receiver<SoundEvent> {
        self.receiver.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_drain() {
        let bus = EventBus::new(4);
        bus.publish(SoundEvent::SourceRemoved {
            source: "a".into(),
        });
        bus.publish(SoundEvent::EndOfStream {
            source: "music".into(),
            queued: 2,
        });
        assert_eq!(bus.pending_count(), 2);

        let events = bus.drain();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], SoundEvent::EndOfStream { queued: 2, .. }));
        assert_eq!(bus.pending_count(), 0);
    }

    #[test]
    fn test_full_bus_drops() {
        let bus = EventBus::new(1);
        for i in 0..3 {
            bus.publish(SoundEvent::SourceRemoved {
                source: format!("s{i}"),
            });
        }
        assert_eq!(
            bus.drain(),
            vec![SoundEvent::SourceRemoved {
                source: "s0".into()
            }]
        );
    }

    #[test]
    fn test_receiver_shares_queue() {
        let bus = EventBus::new(8);
        let rx = bus.receiver();
        bus.publish(SoundEvent::BackendSwitched {
            from: "rodio".into(),
            to: "silent".into(),
        });
        assert!(rx.try_recv().is_ok());
        assert_eq!(bus.pending_count(), 0);
    }
}
