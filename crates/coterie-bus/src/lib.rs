//! Asynchronous messaging infrastructure for Coterie participants.
//!
//! Two distinct delivery mechanisms live here. The [`MessageBus`] queues
//! participant-addressed, typed messages and delivers them from a single
//! background loop; the [`EventBroker`] fans system-wide events out to
//! subscribers synchronously, on the emitter's thread. Both isolate
//! handler failures and keep a bounded history.
//!
//! # Main types
//!
//! - [`MessageBus`] — Queued, asynchronous, kind-subscribed delivery.
//! - [`MessageHandler`] — Async handler trait for bus subscribers.
//! - [`MessageFilter`] — History query filter.
//! - [`EventBroker`] — Synchronous fan-out of [`SystemEvent`]s.

/// Event broker with synchronous fan-out.
pub mod broker;
/// Queued message bus with a background delivery loop.
pub mod bus;

pub use broker::{EventBroker, SystemEvent};
pub use bus::{BusConfig, BusStats, MessageBus, MessageFilter, MessageHandler, SubscriptionId};
