// src/transitions.rs
//! The atomic transition set. Every method here maps onto exactly one
//! server-side script invocation; this layer only marshals arguments and
//! decodes the integer code conventions back into typed results. It is the
//! sole writer of the queue's state sets.

use crate::job::{JobId, JobOptions, JobRecord, JobState};
use crate::keys::KeySpace;
use crate::limiter::RateLimiterOptions;
use crate::scripts::Scripts;
use crate::{Result, SwitchyardError};
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Value;
use std::collections::HashMap;

/// Outcome of a claim attempt.
#[derive(Debug)]
pub enum ActiveClaim {
    /// Nothing ready; fall back to the blocking arm.
    Idle,
    /// The limiter window is exhausted for this many more milliseconds.
    RateLimited { delay_ms: u64 },
    /// The job is locked and active.
    Claimed(JobRecord),
}

/// Which terminal set a finished job lands in.
#[derive(Debug, Clone)]
pub enum FinishTarget {
    Completed { returnvalue: serde_json::Value },
    Failed { reason: String },
}

/// Sets that `clean` can sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanTarget {
    Completed,
    Failed,
    Delayed,
    Wait,
    Paused,
    Active,
}

impl CleanTarget {
    fn as_str(&self) -> &'static str {
        match self {
            CleanTarget::Completed => "completed",
            CleanTarget::Failed => "failed",
            CleanTarget::Delayed => "delayed",
            CleanTarget::Wait => "wait",
            CleanTarget::Paused => "paused",
            CleanTarget::Active => "active",
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn value_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Decodes the `{jobId, HGETALL fields}` reply shape shared by the claim
/// scripts.
fn decode_claimed_job(items: &[Value]) -> Result<JobRecord> {
    let id = items
        .first()
        .and_then(value_string)
        .ok_or_else(|| SwitchyardError::Script("claim reply missing job id".into()))?;
    let fields = match items.get(1) {
        Some(Value::Array(pairs)) => {
            let mut map = HashMap::with_capacity(pairs.len() / 2);
            for chunk in pairs.chunks_exact(2) {
                if let (Some(k), Some(v)) = (value_string(&chunk[0]), value_string(&chunk[1])) {
                    map.insert(k, v);
                }
            }
            map
        }
        _ => {
            return Err(SwitchyardError::Script(
                "claim reply missing job fields".into(),
            ))
        }
    };
    JobRecord::from_hash(JobId(id), fields)
}

fn decode_claim_reply(value: Value) -> Result<ActiveClaim> {
    match value {
        Value::Nil => Ok(ActiveClaim::Idle),
        Value::Int(ms) => Ok(ActiveClaim::RateLimited {
            delay_ms: ms.max(0) as u64,
        }),
        Value::Array(items) => Ok(ActiveClaim::Claimed(decode_claimed_job(&items)?)),
        other => Err(SwitchyardError::Script(format!(
            "unexpected claim reply: {:?}",
            other
        ))),
    }
}

pub struct Transitions {
    keys: KeySpace,
    scripts: Scripts,
    max_events: u64,
}

impl Transitions {
    pub fn new(keys: KeySpace, scripts: Scripts, max_events: u64) -> Self {
        Self {
            keys,
            scripts,
            max_events,
        }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Creates the job hash and routes the id into delayed,
    /// waiting-children or the ready queue, honoring pause, priority and
    /// lifo. Returns the allocated (or deduplicated) id.
    pub async fn add(
        &self,
        conn: &mut ConnectionManager,
        name: &str,
        data: &serde_json::Value,
        opts: &JobOptions,
        limiter: Option<&RateLimiterOptions>,
    ) -> Result<JobId> {
        let timestamp = opts.timestamp.unwrap_or_else(now_ms);
        let group = opts
            .rate_limiter_key
            .clone()
            .or_else(|| limiter.and_then(|l| l.group_for(data)))
            .unwrap_or_default();
        let (parent_key, parent_prefix) = match &opts.parent {
            Some(parent) => (
                self.keys.sibling_job(&parent.queue, &parent.id),
                self.keys.sibling_base(&parent.queue),
            ),
            None => (String::new(), String::new()),
        };

        let id: String = self
            .scripts
            .add_job
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.meta())
            .key(self.keys.delayed())
            .key(self.keys.priority())
            .key(self.keys.events())
            .key(self.keys.marker())
            .key(self.keys.waiting_children())
            .arg(self.keys.base())
            .arg(opts.job_id.as_deref().unwrap_or(""))
            .arg(name)
            .arg(serde_json::to_string(data)?)
            .arg(serde_json::to_string(opts)?)
            .arg(timestamp)
            .arg(opts.delay)
            .arg(opts.priority.min(0x1F_FFFF))
            .arg(flag(opts.lifo))
            .arg(self.max_events)
            .arg(&parent_key)
            .arg(&parent_prefix)
            .arg(flag(opts.wait_children))
            .arg(&group)
            .invoke_async(conn)
            .await?;
        Ok(JobId(id))
    }

    /// Claims the next ready job for `token`, or finalises the claim of a
    /// job the blocking pop already pulled into `active`.
    pub async fn move_to_active(
        &self,
        conn: &mut ConnectionManager,
        token: &str,
        job_id: Option<&str>,
        lock_duration_ms: u64,
        limiter: Option<&RateLimiterOptions>,
    ) -> Result<ActiveClaim> {
        let value: Value = self
            .scripts
            .move_to_active
            .key(self.keys.wait())
            .key(self.keys.active())
            .key(self.keys.priority())
            .key(self.keys.stalled())
            .key(self.keys.limiter())
            .key(self.keys.events())
            .key(self.keys.meta())
            .arg(self.keys.base())
            .arg(token)
            .arg(lock_duration_ms)
            .arg(now_ms())
            .arg(self.max_events)
            .arg(limiter.map(|l| l.max).unwrap_or(0))
            .arg(limiter.map(|l| l.duration_ms).unwrap_or(0))
            .arg(flag(limiter.map(|l| l.grouped()).unwrap_or(false)))
            .arg(job_id.unwrap_or(""))
            .invoke_async(conn)
            .await?;
        decode_claim_reply(value)
    }

    /// Refreshes the job lock; `false` means the lock was lost and the
    /// worker must abort processing.
    pub async fn extend_lock(
        &self,
        conn: &mut ConnectionManager,
        job_id: &JobId,
        token: &str,
        duration_ms: u64,
    ) -> Result<bool> {
        let code: i64 = self
            .scripts
            .extend_lock
            .key(self.keys.lock(job_id.as_str()))
            .key(self.keys.stalled())
            .arg(token)
            .arg(duration_ms)
            .arg(job_id.as_str())
            .invoke_async(conn)
            .await?;
        Ok(code == 1)
    }

    /// Finishes an active job. With `fetch_next`, the next ready job is
    /// claimed in the same script call and returned.
    pub async fn move_to_finished(
        &self,
        conn: &mut ConnectionManager,
        job_id: &JobId,
        token: &str,
        target: &FinishTarget,
        keep_encoded: i64,
        fetch_next: bool,
        lock_duration_ms: u64,
        limiter: Option<&RateLimiterOptions>,
    ) -> Result<Option<JobRecord>> {
        let (target_key, field, value, event) = match target {
            FinishTarget::Completed { returnvalue } => (
                self.keys.completed(),
                "returnvalue",
                serde_json::to_string(returnvalue)?,
                "completed",
            ),
            FinishTarget::Failed { reason } => (
                self.keys.failed(),
                "failedReason",
                reason.clone(),
                "failed",
            ),
        };

        let reply: Value = self
            .scripts
            .move_to_finished
            .key(self.keys.active())
            .key(target_key)
            .key(self.keys.job(job_id.as_str()))
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.priority())
            .key(self.keys.events())
            .key(self.keys.meta())
            .key(self.keys.stalled())
            .key(self.keys.limiter())
            .arg(self.keys.base())
            .arg(job_id.as_str())
            .arg(token)
            .arg(now_ms())
            .arg(field)
            .arg(value)
            .arg(event)
            .arg(keep_encoded)
            .arg(flag(fetch_next))
            .arg(lock_duration_ms)
            .arg(self.max_events)
            .arg(limiter.map(|l| l.max).unwrap_or(0))
            .arg(limiter.map(|l| l.duration_ms).unwrap_or(0))
            .arg(flag(limiter.map(|l| l.grouped()).unwrap_or(false)))
            .invoke_async(conn)
            .await?;

        match reply {
            Value::Int(code) if code < 0 => Err(SwitchyardError::from_code(code, job_id.as_str())),
            Value::Int(_) | Value::Nil => Ok(None),
            Value::Array(items) => Ok(Some(decode_claimed_job(&items)?)),
            other => Err(SwitchyardError::Script(format!(
                "unexpected finish reply: {:?}",
                other
            ))),
        }
    }

    /// Reschedules an active job to wake at `timestamp_ms`.
    pub async fn move_to_delayed(
        &self,
        conn: &mut ConnectionManager,
        job_id: &JobId,
        token: Option<&str>,
        timestamp_ms: i64,
    ) -> Result<()> {
        let code: i64 = self
            .scripts
            .move_to_delayed
            .key(self.keys.active())
            .key(self.keys.delayed())
            .key(self.keys.job(job_id.as_str()))
            .key(self.keys.events())
            .key(self.keys.marker())
            .arg(job_id.as_str())
            .arg(token.unwrap_or(""))
            .arg(timestamp_ms)
            .arg(self.max_events)
            .invoke_async(conn)
            .await?;
        if code < 0 {
            return Err(SwitchyardError::from_code(code, job_id.as_str()));
        }
        Ok(())
    }

    /// Parks an active job until its children finish. Returns `false` when
    /// there were no pending dependencies and the job stayed active.
    pub async fn move_to_waiting_children(
        &self,
        conn: &mut ConnectionManager,
        job_id: &JobId,
        token: &str,
    ) -> Result<bool> {
        let code: i64 = self
            .scripts
            .move_to_waiting_children
            .key(self.keys.active())
            .key(self.keys.waiting_children())
            .key(self.keys.job(job_id.as_str()))
            .key(self.keys.events())
            .arg(job_id.as_str())
            .arg(token)
            .arg(self.max_events)
            .invoke_async(conn)
            .await?;
        match code {
            1 => Ok(true),
            0 => Ok(false),
            code => Err(SwitchyardError::from_code(code, job_id.as_str())),
        }
    }

    /// Makes a delayed job ready immediately.
    pub async fn promote(&self, conn: &mut ConnectionManager, job_id: &JobId) -> Result<()> {
        let code: i64 = self
            .scripts
            .promote
            .key(self.keys.delayed())
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.priority())
            .key(self.keys.events())
            .key(self.keys.meta())
            .key(self.keys.job(job_id.as_str()))
            .arg(job_id.as_str())
            .arg(self.max_events)
            .invoke_async(conn)
            .await?;
        if code < 0 {
            return Err(SwitchyardError::from_code(code, job_id.as_str()));
        }
        Ok(())
    }

    /// Promotes every due delayed job and returns the composite score of
    /// the next one, so the pump can sleep precisely.
    pub async fn update_delay_set(
        &self,
        conn: &mut ConnectionManager,
        now_ms: i64,
    ) -> Result<Option<i64>> {
        let value: Value = self
            .scripts
            .update_delay_set
            .key(self.keys.delayed())
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.priority())
            .key(self.keys.events())
            .key(self.keys.meta())
            .arg(self.keys.base())
            .arg(now_ms)
            .arg(self.max_events)
            .arg(1000)
            .invoke_async(conn)
            .await?;
        match value {
            Value::Int(_) => Ok(None),
            ref v => match value_string(v) {
                Some(raw) => raw
                    .parse::<f64>()
                    .map(|score| Some(score as i64))
                    .map_err(|_| {
                        SwitchyardError::Script(format!("bad delay score: {}", raw))
                    }),
                None => Err(SwitchyardError::Script(format!(
                    "unexpected delay reply: {:?}",
                    v
                ))),
            },
        }
    }

    pub async fn pause(&self, conn: &mut ConnectionManager, paused: bool) -> Result<()> {
        let _: i64 = self
            .scripts
            .pause
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.meta())
            .key(self.keys.events())
            .arg(flag(paused))
            .arg(self.max_events)
            .invoke_async(conn)
            .await?;
        Ok(())
    }

    /// Puts an active job straight back on the ready queue (zero-delay
    /// retry).
    pub async fn retry_job(
        &self,
        conn: &mut ConnectionManager,
        job_id: &JobId,
        token: Option<&str>,
        lifo: bool,
    ) -> Result<()> {
        let code: i64 = self
            .scripts
            .retry_job
            .key(self.keys.active())
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.priority())
            .key(self.keys.job(job_id.as_str()))
            .key(self.keys.events())
            .key(self.keys.meta())
            .arg(job_id.as_str())
            .arg(token.unwrap_or(""))
            .arg(flag(lifo))
            .arg(self.max_events)
            .invoke_async(conn)
            .await?;
        if code < 0 {
            return Err(SwitchyardError::from_code(code, job_id.as_str()));
        }
        Ok(())
    }

    /// Moves a finished job from `completed`/`failed` back to the ready
    /// queue. Uses its own code convention: 1 ok, 0 missing, -1 locked,
    /// -2 not in the expected state.
    pub async fn reprocess_job(
        &self,
        conn: &mut ConnectionManager,
        job_id: &JobId,
        state: JobState,
        lifo: bool,
    ) -> Result<()> {
        let (source, clear_field) = match state {
            JobState::Completed => (self.keys.completed(), "returnvalue"),
            JobState::Failed => (self.keys.failed(), "failedReason"),
            other => {
                return Err(SwitchyardError::Script(format!(
                    "cannot reprocess from state {}",
                    other.as_str()
                )))
            }
        };
        let code: i64 = self
            .scripts
            .reprocess_job
            .key(source)
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.priority())
            .key(self.keys.job(job_id.as_str()))
            .key(self.keys.events())
            .key(self.keys.meta())
            .arg(job_id.as_str())
            .arg(flag(lifo))
            .arg(self.max_events)
            .arg(clear_field)
            .invoke_async(conn)
            .await?;
        match code {
            1 => Ok(()),
            0 => Err(SwitchyardError::MissingJob(job_id.to_string())),
            -1 => Err(SwitchyardError::LockLost(job_id.to_string())),
            -2 => Err(SwitchyardError::WrongState(job_id.to_string())),
            code => Err(SwitchyardError::Script(format!(
                "unknown reprocess code {} for job {}",
                code, job_id
            ))),
        }
    }

    /// Removes a job and its children everywhere. Refuses while any job in
    /// the tree holds a lock.
    pub async fn remove(&self, conn: &mut ConnectionManager, job_id: &JobId) -> Result<()> {
        let code: i64 = self
            .scripts
            .remove_job
            .key(self.keys.events())
            .arg(self.keys.base())
            .arg(job_id.as_str())
            .arg(self.max_events)
            .invoke_async(conn)
            .await?;
        match code {
            1 => Ok(()),
            -1 => Err(SwitchyardError::LockLost(job_id.to_string())),
            code => Err(SwitchyardError::Script(format!(
                "unknown remove code {} for job {}",
                code, job_id
            ))),
        }
    }

    /// Removes up to `limit` jobs older than the cutoff from one state set
    /// and returns their ids.
    pub async fn clean_jobs_in_set(
        &self,
        conn: &mut ConnectionManager,
        target: CleanTarget,
        cutoff_ms: i64,
        limit: i64,
    ) -> Result<Vec<JobId>> {
        let set_key = match target {
            CleanTarget::Completed => self.keys.completed(),
            CleanTarget::Failed => self.keys.failed(),
            CleanTarget::Delayed => self.keys.delayed(),
            CleanTarget::Wait => self.keys.wait(),
            CleanTarget::Paused => self.keys.paused(),
            CleanTarget::Active => self.keys.active(),
        };
        let ids: Vec<String> = self
            .scripts
            .clean_jobs_in_set
            .key(set_key)
            .key(self.keys.priority())
            .key(self.keys.events())
            .arg(self.keys.base())
            .arg(target.as_str())
            .arg(cutoff_ms)
            .arg(limit)
            .invoke_async(conn)
            .await?;
        Ok(ids.into_iter().map(JobId).collect())
    }

    /// One bounded round of queue destruction; `Ok(true)` means call again.
    pub async fn obliterate(
        &self,
        conn: &mut ConnectionManager,
        count: u32,
        force: bool,
    ) -> Result<bool> {
        let code: i64 = self
            .scripts
            .obliterate
            .key(self.keys.meta())
            .key(self.keys.active())
            .arg(self.keys.base())
            .arg(count)
            .arg(flag(force))
            .invoke_async(conn)
            .await?;
        match code {
            0 => Ok(false),
            1 => Ok(true),
            -1 => Err(SwitchyardError::QueueNotPaused),
            -2 => Err(SwitchyardError::ActiveJobs),
            code => Err(SwitchyardError::Script(format!(
                "unknown obliterate code {}",
                code
            ))),
        }
    }

    /// Atomically empties wait and paused (and optionally delayed),
    /// deleting the job hashes. Returns how many jobs were dropped.
    pub async fn drain(
        &self,
        conn: &mut ConnectionManager,
        include_delayed: bool,
    ) -> Result<u64> {
        let count: i64 = self
            .scripts
            .drain
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.delayed())
            .key(self.keys.priority())
            .key(self.keys.events())
            .arg(self.keys.base())
            .arg(flag(include_delayed))
            .arg(self.max_events)
            .invoke_async(conn)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// One stall sweep. Returns the ids that were failed outright and the
    /// ids recovered back onto the ready queue.
    pub async fn move_stalled_jobs(
        &self,
        conn: &mut ConnectionManager,
        max_stalled_count: u32,
        stalled_interval_ms: u64,
    ) -> Result<(Vec<JobId>, Vec<JobId>)> {
        let (failed, stalled): (Vec<String>, Vec<String>) = self
            .scripts
            .move_stalled_jobs_to_wait
            .key(self.keys.stalled())
            .key(self.keys.wait())
            .key(self.keys.active())
            .key(self.keys.failed())
            .key(self.keys.stalled_check())
            .key(self.keys.meta())
            .key(self.keys.paused())
            .key(self.keys.events())
            .key(self.keys.priority())
            .arg(max_stalled_count)
            .arg(self.keys.base())
            .arg(now_ms())
            .arg(stalled_interval_ms)
            .arg(self.max_events)
            .invoke_async(conn)
            .await?;
        Ok((
            failed.into_iter().map(JobId).collect(),
            stalled.into_iter().map(JobId).collect(),
        ))
    }

    /// Which state set currently holds the job.
    pub async fn get_state(
        &self,
        conn: &mut ConnectionManager,
        job_id: &JobId,
    ) -> Result<JobState> {
        let state: String = self
            .scripts
            .get_state
            .key(self.keys.completed())
            .key(self.keys.failed())
            .key(self.keys.delayed())
            .key(self.keys.active())
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.waiting_children())
            .arg(job_id.as_str())
            .invoke_async(conn)
            .await?;
        Ok(JobState::parse(&state))
    }

    pub async fn update_progress(
        &self,
        conn: &mut ConnectionManager,
        job_id: &JobId,
        progress: &serde_json::Value,
    ) -> Result<()> {
        let code: i64 = self
            .scripts
            .update_progress
            .key(self.keys.job(job_id.as_str()))
            .key(self.keys.events())
            .arg(job_id.as_str())
            .arg(serde_json::to_string(progress)?)
            .arg(self.max_events)
            .invoke_async(conn)
            .await?;
        if code < 0 {
            return Err(SwitchyardError::from_code(code, job_id.as_str()));
        }
        Ok(())
    }
}
