pub mod keys;
pub mod models;
pub mod ports;

pub use keys::{JobTables, TableLayout, ID_GENERATOR_FIELD};
pub use models::*;
pub use packet_core::{SchedulerError, SchedulerResult};
pub use ports::*;
