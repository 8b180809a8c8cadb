pub mod entry;
pub mod exec_launcher;
pub mod handlers;
pub mod task_launcher;
pub mod worker;

pub use entry::run_worker_process;
pub use exec_launcher::ExecLauncher;
pub use handlers::{EchoHandler, HandlerRegistry, ShellHandler, ShellTask};
pub use task_launcher::{TaskLauncher, TaskPool};
pub use worker::{Worker, WorkerSummary};
