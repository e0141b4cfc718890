//! Run events emitted by the scheduler.
//!
//! The engine owns one [`EventSink`]; there is no global sink, so isolated
//! engines in tests never observe each other's events.

mod sink;

pub use sink::{CollectingEventSink, EngineEvent, EventSink, LoggingEventSink, NoOpEventSink};
