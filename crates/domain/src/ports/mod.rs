pub mod handler;
pub mod launcher;
pub mod store;

pub use handler::{TaskHandler, TaskOutcome};
pub use launcher::{ProcessProbe, WorkerLauncher};
pub use store::CoordinationStore;
