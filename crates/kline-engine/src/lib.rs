pub mod assembler;
pub mod commit;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod job;
pub mod retry;
pub mod scheduler;
pub mod sink;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use error::{ErrorKind, JobError};
pub use job::{Job, JobOutcome, JobResult, RunReport};
pub use scheduler::JobScheduler;
pub use sink::SeriesSink;
