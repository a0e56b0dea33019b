//! Job registry, tier queues, worker pool and task supervision.

pub mod model;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod supervisor;
pub mod worker;

pub use model::{
    CalculationParams, Job, JobId, JobParameters, JobStatus, JobType, PaymentReference,
};
pub use queue::TierDepth;
pub use registry::{
    JobEvent, JobFilter, JobRegistry, JobStatistics, NewJob, PaymentState, QueueStatus,
    spawn_cleanup_task,
};
pub use scheduler::Scheduler;
pub use supervisor::{ShutdownReport, TaskSupervisor};
pub use worker::WorkerDeps;
