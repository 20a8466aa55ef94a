pub mod discovery;
mod entrypoint;
pub mod error;
pub mod proto;
pub mod queue;
pub mod rpc;
pub mod scheduler;
pub mod tenant;
pub mod worker;

pub use entrypoint::{run_querier, run_scheduler, run_standalone};
pub use scheduler::Scheduler;
