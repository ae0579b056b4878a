//! Event-sourcing and CQRS runtime: an optimistic-concurrency event store,
//! a command registry, projection handlers with replay and refresh, and a
//! reliable topic-routed event bus.

pub mod commands;
pub mod config;
pub mod domain;
pub mod event_sourcing;
pub mod messaging;
pub mod metrics;
pub mod projection;
pub mod utils;
