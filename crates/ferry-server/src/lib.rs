mod backoff;
mod builder;
mod service;

pub use backoff::{Backoff, BackoffConfig};
pub use builder::{ServerBuilder, ServerBuilderOptions};
pub use service::{ServiceState, ServiceStateCell};
