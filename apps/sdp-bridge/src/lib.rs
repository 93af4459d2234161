pub mod channel;
pub mod config;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod routes;
pub mod signaling;
pub mod state;
pub mod telemetry;
