//! Event bus and telemetry sink
//!
//! Every state transition in the core emits a [`BuildEvent`] onto the
//! [`EventBus`]. The bus is single-producer-per-publish, multi-consumer:
//! each subscriber owns a bounded ring and receives events in publish
//! order. Publishing never blocks: when a subscriber's ring is full the
//! oldest pending event is dropped, the subscriber is marked degraded and
//! its overflow counter is incremented.
//!
//! The [`TelemetrySink`] is an ordinary subscriber that records finished
//! sessions to disk, honoring the `BUILDER_TELEMETRY_*` environment
//! contract.

mod bus;
mod event;
mod telemetry;

pub use bus::{EventBus, Subscription, SubscriptionStats};
pub use event::{BuildEvent, EventRecord};
pub use telemetry::{TelemetryConfig, TelemetrySink};
