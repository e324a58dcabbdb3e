pub mod assignment;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod geo;
pub mod notify;
pub mod queue;
pub mod registry;
pub mod store;
pub mod telemetry;
pub mod types;

#[cfg(feature = "test-helpers")]
pub mod test_helpers;
