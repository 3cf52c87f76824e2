//! Tumbler execution event bus.
//!
//! - [`EventBus`]: per-workflow publish/subscribe hub. Each workflow gets a
//!   topic that buffers every published [`StateEvent`] so late or
//!   reconnecting subscribers can replay from a cursor.
//! - [`Subscription`]: one subscriber's ordered view of a topic, exposed as
//!   a [`futures::Stream`] that ends after the terminal event.
//!
//! [`StateEvent`]: tumbler_core::state::StateEvent

pub mod bus;
pub mod subscription;

pub use bus::EventBus;
pub use subscription::Subscription;
