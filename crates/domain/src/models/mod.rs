pub mod allocation;
pub mod job;
pub mod options;
pub mod packet;
pub mod status;

pub use allocation::{Allocation, ProcessRecord, WorkerEntry};
pub use job::{JobIdentity, JobInfo, JobResult, JobWindow, DEFAULT_NAMESPACE};
pub use options::{CallMode, ExecuteOptions, SortMode, WorkerSpec};
pub use packet::{deserialize_task, serialize_task, Packet, PacketId, PacketRef, Task};
pub use status::{JobStatus, PacketCounts, PacketStatus, StatusBucket};
