pub mod app;
pub mod cli;

pub use app::{load_tasks, parse_tasks, Application, RunRequest};
