//! Wire messages and gRPC service stubs.
//!
//! The messages are declared with `prost` derives and the service stubs are generated
//! at build time, so no `.proto` compilation step is needed.

pub mod frontend;
pub mod http;
pub mod scheduler;
