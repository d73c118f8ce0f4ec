//! Fan-out of hub events to subscribers.
//!
//! One broadcast channel carries everything the runtime emits. Consumers
//! either take the whole firehose ([`EventBus::subscribe`]) or a single
//! tenant's slice of it ([`EventBus::subscribe_session`]), which is what
//! the websocket surface uses to stream one session's lifecycle.
//!
//! Publishing never blocks and never fails: with no subscribers the event
//! is dropped, and a subscriber that falls behind skips ahead, with the
//! gap counted on its receiver rather than stalling the publisher.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tracing::{trace, warn};
use wahub_core::SessionKey;

use crate::event::HubEvent;

/// Events buffered per subscriber before a slow one starts skipping.
const CHANNEL_CAPACITY: usize = 1024;

struct BusShared {
    sender: broadcast::Sender<Arc<HubEvent>>,
    published: AtomicU64,
}

/// Fan-out of [`HubEvent`]s to any number of subscribers.
///
/// Clones are cheap handles onto the same channel; every component holds
/// its own clone and publishes through it.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<BusShared>,
}

impl EventBus {
    /// A bus with the default per-subscriber buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    /// A bus with an explicit per-subscriber buffer.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            shared: Arc::new(BusShared {
                sender,
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Publish an event to every current subscriber.
    ///
    /// Returns how many receivers got it. Zero receivers is not an error;
    /// the event is dropped and only the published counter moves.
    pub fn publish(&self, event: HubEvent) -> usize {
        self.shared.published.fetch_add(1, Ordering::Relaxed);
        let topic = event.event_type();
        match self.shared.sender.send(Arc::new(event)) {
            Ok(count) => {
                trace!(topic, receiver_count = count, "Event published");
                count
            }
            Err(_) => {
                trace!(topic, "Event dropped, no subscribers");
                0
            }
        }
    }

    /// Subscribe to every event from this point on.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.shared.sender.subscribe(),
            missed: 0,
        }
    }

    /// Subscribe to one session's events only.
    ///
    /// Other tenants' traffic and fleet-wide events (instance lifecycle,
    /// drift alerts) are filtered out.
    #[must_use]
    pub fn subscribe_session(&self, key: SessionKey) -> SessionEvents {
        SessionEvents {
            inner: self.subscribe(),
            key,
        }
    }

    /// Events published over the bus's lifetime.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.shared.published.load(Ordering::Relaxed)
    }

    /// Live subscribers, session-filtered ones included.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("published", &self.published_count())
            .finish()
    }
}

/// The firehose side of the bus.
pub struct EventReceiver {
    receiver: broadcast::Receiver<Arc<HubEvent>>,
    missed: u64,
}

impl EventReceiver {
    /// The next event, or `None` once the bus is gone.
    ///
    /// Falling behind does not end the stream: the receiver jumps to the
    /// oldest retained event and the gap is added to [`Self::missed`].
    pub async fn recv(&mut self) -> Option<Arc<HubEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.missed = self.missed.saturating_add(skipped);
                    warn!(skipped, total_missed = self.missed,
                        "Subscriber lagged, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking [`Self::recv`]; `None` when nothing is queued or the
    /// bus is gone.
    pub fn try_recv(&mut self) -> Option<Arc<HubEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    self.missed = self.missed.saturating_add(skipped);
                }
                Err(
                    broadcast::error::TryRecvError::Empty
                    | broadcast::error::TryRecvError::Closed,
                ) => return None,
            }
        }
    }

    /// How many events this receiver skipped because it fell behind.
    #[must_use]
    pub fn missed(&self) -> u64 {
        self.missed
    }
}

/// A receiver narrowed to one session.
pub struct SessionEvents {
    inner: EventReceiver,
    key: SessionKey,
}

impl SessionEvents {
    /// The next event concerning this session, or `None` once the bus is
    /// gone.
    pub async fn recv(&mut self) -> Option<Arc<HubEvent>> {
        loop {
            let event = self.inner.recv().await?;
            if event.session_key() == Some(&self.key) {
                return Some(event);
            }
        }
    }

    /// The session this receiver follows.
    #[must_use]
    pub fn session_key(&self) -> &SessionKey {
        &self.key
    }

    /// How many events the underlying receiver skipped, filtered or not.
    #[must_use]
    pub fn missed(&self) -> u64 {
        self.inner.missed()
    }
}
