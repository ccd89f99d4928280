//! Infrastructure layer: job queue, admission control, event publishing,
//! configuration and connections.

pub mod config;
pub mod connections;
pub mod event_bus;
pub mod jobs;
pub mod publisher;
pub mod ratelimit;

mod integration_tests;

pub use config::{ConfigError, DispatchConfig};
pub use publisher::{EventPublisher, PublisherStats};
