//! Wahub Events - event bus for the session hosting service.
//!
//! This crate provides:
//! - Domain event types for every externally visible session transition
//! - A non-blocking fan-out bus with firehose and per-session
//!   subscriptions
//!
//! Delivery is at-least-once per in-process subscriber; a subscriber that
//! falls behind skips ahead (the skip is counted on its receiver) rather
//! than blocking publishers. The per-session view
//! ([`EventBus::subscribe_session`]) is what per-tenant consumers use to
//! follow one session's lifecycle without seeing the rest of the fleet.
//!
//! # Example
//!
//! ```rust
//! use wahub_events::{EventBus, EventMetadata, HubEvent};
//! use wahub_core::SessionKey;
//!
//! # async fn example() {
//! let bus = EventBus::new();
//! let key = SessionKey::parse("U1", "+12025550101").unwrap();
//! let mut session_events = bus.subscribe_session(key.clone());
//!
//! bus.publish(HubEvent::SyncStarted {
//!     metadata: EventMetadata::new("pool"),
//!     key,
//! });
//!
//! let event = session_events.recv().await.unwrap();
//! assert_eq!(event.event_type(), "sync_started");
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod bus;
mod event;

pub use bus::{EventBus, EventReceiver, SessionEvents};
pub use event::{EventMetadata, HubEvent};
