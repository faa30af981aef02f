pub mod job;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod worker;

// Re-export common types
pub use job::{ExecutionResult, Job, JobConfig, JobId, JobStatus, JobSubmission, Priority, StatusUpdate};
pub use retry::{Decision, RetryPolicy};
pub use scheduler::Scheduler;
pub use store::{create_task_store, MemoryTaskStore, PostgresTaskStore, TaskStore};
pub use worker::{execute, WorkerContext, WorkerPool};
