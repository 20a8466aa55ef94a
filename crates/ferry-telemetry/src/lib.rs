pub mod common;
pub mod error;
pub mod futures;
pub mod metrics;
pub mod recorder;
pub mod telemetry;
pub mod trace;
