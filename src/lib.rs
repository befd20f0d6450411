// src/lib.rs
//! switchyard: a Redis-backed distributed job queue
//!
//! Producers enqueue typed jobs; workers on any number of hosts atomically
//! claim, process and report them. Supports priorities, delayed execution,
//! FIFO/LIFO ordering, rate-limited groups, parent/child dependencies,
//! stall recovery, pause/resume and bulk cleanup. Every state transition is
//! a single server-side script, so a crashed worker can never lose or
//! duplicate a job.

pub mod backoff;
pub mod client;
pub mod context;
pub mod error;
pub mod events;
pub mod job;
pub mod keys;
pub mod limiter;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod scripts;
pub mod transitions;
pub mod worker;

pub use backoff::{Backoff, BackoffStrategy};
pub use client::{ServerVersion, StoreClient};
pub use context::{AppContext, JobContext};
pub use error::{Result, SwitchyardError};
pub use events::{EventBus, QueueEvent};
pub use job::{Job, JobId, JobOptions, JobRecord, JobState, KeepPolicy, ParentRef, RepeatOptions};
pub use keys::KeySpace;
pub use limiter::RateLimiterOptions;
pub use queue::{Queue, QueueOptions, RepeatableJob};
pub use registry::JobRegistry;
pub use scheduler::{QueueScheduler, SchedulerOptions};
pub use transitions::{ActiveClaim, CleanTarget, FinishTarget, Transitions};
pub use worker::{Worker, WorkerBuilder, WorkerOptions};

// Re-export commonly used types
pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
