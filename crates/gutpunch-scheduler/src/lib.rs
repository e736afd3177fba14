//! `gutpunch-scheduler` — durable job scheduler with SQLite persistence.
//!
//! # Overview
//!
//! Jobs are rows in a SQLite `jobs` table, optionally grouped into priority
//! `queues`. Host code registers named handlers with the
//! [`engine::SchedulerEngine`], enqueues work, and starts the poll loop. Every
//! tick selects PENDING jobs whose `scheduled_time` has arrived and runs them
//! through a bounded worker pool, writing the outcome back to the row.
//!
//! # Job status
//!
//! | Status      | Code | Meaning                                              |
//! |-------------|------|------------------------------------------------------|
//! | `Pending`   | 0    | Waiting to be selected                               |
//! | `Running`   | 1    | Claimed by a dispatcher, handler in flight           |
//! | `Completed` | 2    | Handler returned `Ok` (terminal)                     |
//! | `Failed`    | 3    | Last attempt failed; requeued on a later tick        |
//! | `Dead`      | 4    | Retries exhausted (terminal)                         |
//!
//! Handlers are process-local and must be registered again after a restart.

pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod error;
mod executor;
pub mod jobs;
pub mod queues;
pub mod registry;
pub mod schedule;
pub mod storage;
pub mod time;
pub mod types;

pub use dispatcher::QueueDispatcher;
pub use engine::{EngineSettings, EnqueueOptions, PollHandle, SchedulerEngine};
pub use error::{Result, SchedulerError};
pub use jobs::JobRepository;
pub use queues::QueueRepository;
pub use registry::{async_handler_fn, handler_fn, HandlerRegistry, JobHandler};
pub use schedule::{Delay, Schedule};
pub use storage::{Filter, Gateway, Table};
pub use types::{
    Job, JobId, JobStatus, JobUpdate, NewJob, NewQueue, Parameters, Queue, QueueId, QueueUpdate,
    TickReport,
};
