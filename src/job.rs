// src/job.rs
use crate::backoff::BackoffStrategy;
use crate::{JobContext, Result, SwitchyardError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Number of distinct delay-score slots per millisecond. The low 12 bits of
/// a numeric job id break ties between jobs delayed to the same millisecond;
/// ids further than 4095 apart within one millisecond can wake out of FIFO
/// order.
pub const DELAY_SLOTS_PER_MS: i64 = 4096;

/// Unique identifier for a job. Either allocated from the queue's counter or
/// supplied by the caller; rate-limited groups append `:<group>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading numeric portion of the id, if any. Grouped ids such as
    /// `17:billing` still yield 17.
    pub fn numeric(&self) -> Option<i64> {
        let digits: String = self.0.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse().ok()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Packs a wake timestamp and an id tiebreaker into one sorted-set score.
pub fn composite_delay_score(timestamp_ms: i64, id: &JobId) -> i64 {
    let tie = id.numeric().unwrap_or(0) & 0xFFF;
    timestamp_ms.max(0) * DELAY_SLOTS_PER_MS + tie
}

/// Recovers the wake timestamp from a composite score.
pub fn delay_score_timestamp(score: i64) -> i64 {
    score / DELAY_SLOTS_PER_MS
}

/// Current state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Waiting,
    WaitingChildren,
    Delayed,
    Active,
    Completed,
    Failed,
    Paused,
    Unknown,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::WaitingChildren => "waiting-children",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Paused => "paused",
            JobState::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> JobState {
        match value {
            "waiting" => JobState::Waiting,
            "waiting-children" => JobState::WaitingChildren,
            "delayed" => JobState::Delayed,
            "active" => JobState::Active,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            "paused" => JobState::Paused,
            _ => JobState::Unknown,
        }
    }
}

/// What to do with the job hash once it reaches a terminal set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeepPolicy {
    /// Keep the job and its hash forever.
    KeepAll,
    /// Delete the hash immediately; the terminal set is not written.
    Remove,
    /// Keep only the most recent N entries of the terminal set.
    KeepLast(u32),
}

impl Default for KeepPolicy {
    fn default() -> Self {
        KeepPolicy::KeepAll
    }
}

impl KeepPolicy {
    /// Wire encoding used by the finish script: -1 keep, 0 delete, N window.
    pub(crate) fn encode(&self) -> i64 {
        match self {
            KeepPolicy::KeepAll => -1,
            KeepPolicy::Remove => 0,
            KeepPolicy::KeepLast(n) => *n as i64,
        }
    }
}

/// Reference to a parent job that should wait for this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub id: String,
    /// Queue name under the same root prefix.
    pub queue: String,
}

/// Repeat descriptor stored in the `repeat` sorted set. The schedule
/// evaluator lives outside this crate; the queue only stores and lists
/// these entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatOptions {
    pub every_ms: Option<u64>,
    pub pattern: Option<String>,
}

/// Job execution options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub job_id: Option<String>,
    /// 0 disables priority; otherwise lower values are served first and
    /// equal priorities keep their insertion order. Effective range is
    /// 0..=2^21-1 so the packed sorted-set score stays exact.
    pub priority: u32,
    /// Milliseconds to hold the job in `delayed` before it becomes ready.
    pub delay: u64,
    pub lifo: bool,
    /// Creation timestamp override, ms since epoch.
    pub timestamp: Option<i64>,
    /// Total attempts before the job lands in `failed`.
    pub attempts: u32,
    pub backoff: Option<BackoffStrategy>,
    pub remove_on_complete: KeepPolicy,
    pub remove_on_fail: KeepPolicy,
    pub parent: Option<ParentRef>,
    /// Park the job in `waiting-children` at add time when it already has
    /// registered dependencies.
    pub wait_children: bool,
    pub repeat: Option<RepeatOptions>,
    /// Explicit rate-limit group, overriding the limiter's payload path.
    pub rate_limiter_key: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            priority: 0,
            delay: 0,
            lifo: false,
            timestamp: None,
            attempts: 1,
            backoff: None,
            remove_on_complete: KeepPolicy::KeepAll,
            remove_on_fail: KeepPolicy::KeepAll,
            parent: None,
            wait_children: false,
            repeat: None,
            rate_limiter_key: None,
        }
    }
}

/// View over the per-job Redis hash. Field names match the hash verbatim.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub data: serde_json::Value,
    pub opts: JobOptions,
    pub timestamp: i64,
    pub delay: u64,
    pub priority: u32,
    pub attempts_made: u32,
    pub stalled_counter: u32,
    pub progress: Option<serde_json::Value>,
    pub processed_on: Option<i64>,
    pub finished_on: Option<i64>,
    pub returnvalue: Option<serde_json::Value>,
    pub failed_reason: Option<String>,
    pub parent_key: Option<String>,
}

impl JobRecord {
    pub fn from_hash(id: JobId, fields: HashMap<String, String>) -> Result<Self> {
        if fields.is_empty() {
            return Err(SwitchyardError::MissingJob(id.0));
        }
        let opts = match fields.get("opts") {
            Some(raw) => serde_json::from_str(raw)?,
            None => JobOptions::default(),
        };
        let parse_i64 = |field: &str| fields.get(field).and_then(|v| v.parse::<i64>().ok());
        let parse_u32 =
            |field: &str| fields.get(field).and_then(|v| v.parse::<u32>().ok()).unwrap_or(0);
        let parse_json = |field: &str| {
            fields
                .get(field)
                .and_then(|v| serde_json::from_str(v).ok())
        };

        Ok(Self {
            name: fields.get("name").cloned().unwrap_or_default(),
            data: fields
                .get("data")
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or(serde_json::Value::Null),
            opts,
            timestamp: parse_i64("timestamp").unwrap_or(0),
            delay: parse_i64("delay").unwrap_or(0).max(0) as u64,
            priority: parse_u32("priority"),
            attempts_made: parse_u32("attemptsMade"),
            stalled_counter: parse_u32("stalledCounter"),
            progress: parse_json("progress"),
            processed_on: parse_i64("processedOn"),
            finished_on: parse_i64("finishedOn"),
            returnvalue: parse_json("returnvalue"),
            failed_reason: fields.get("failedReason").cloned(),
            parent_key: fields.get("parentKey").cloned(),
            id,
        })
    }

    /// Deserializes the payload into the caller's type. The store holds no
    /// schema; typing is the producer/worker contract.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Core trait implemented by every processable job type.
#[async_trait::async_trait]
pub trait Job: Send + Sync + 'static + serde::de::DeserializeOwned + serde::Serialize {
    /// Executes the job. The returned value is stored as `returnvalue` on
    /// completion.
    async fn perform(&self, ctx: &JobContext) -> Result<serde_json::Value>;

    /// Job type name for registration and dispatch.
    fn name() -> &'static str
    where
        Self: Sized;

    /// Default options for this job type.
    fn default_options() -> JobOptions
    where
        Self: Sized,
    {
        JobOptions::default()
    }
}
