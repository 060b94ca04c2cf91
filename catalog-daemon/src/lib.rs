//! Long-running reconcile service: descriptor watcher, bounded worker pool
//! with per-repository retry, and a control socket.

mod error;
pub mod paths;
pub mod protocol;
pub mod queue;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_reconcile, request_status, request_stop, send_request, DaemonRequest, DaemonResponse,
};
pub use queue::{retry_delay, WorkQueue};
pub use runtime::{init_tracing, run, start_blocking, RunLog, RunRecord};
