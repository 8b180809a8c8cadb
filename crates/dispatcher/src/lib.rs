pub mod aggregator;
pub mod allocator;
pub mod launcher;
pub mod ledger;
pub mod process_table;
pub mod registry;
pub mod scheduler;
pub mod sorter;

pub use aggregator::{derive_job_status, load_job_info, JobSnapshot, JobStatusAggregator};
pub use allocator::WorkAllocator;
pub use launcher::ProcessLauncher;
pub use ledger::AllocationLedger;
pub use process_table::{JobWorkers, ProcessTable};
pub use registry::PacketRegistry;
pub use scheduler::{Dispatch, Execution, JobHandle, Scheduler, HANDLE_CACHE_CAPACITY};
pub use sorter::{sort_packets, PacketSorter};
