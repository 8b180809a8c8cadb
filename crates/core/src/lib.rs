pub mod config;
pub mod errors;
pub mod logging;
pub mod retry;
pub mod time;

pub use config::*;
pub use errors::*;
pub use logging::{init_logging, init_worker_logging};
pub use retry::{RetryPolicy, RETRY_COUNT};
pub use time::{millis_to_datetime, now_millis};
