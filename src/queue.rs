// src/queue.rs
use crate::client::StoreClient;
use crate::events::{EventBus, QueueEvent};
use crate::job::{JobId, JobOptions, JobRecord, JobState};
use crate::keys::KeySpace;
use crate::limiter::RateLimiterOptions;
use crate::scripts::Scripts;
use crate::transitions::{now_ms, CleanTarget, Transitions};
use crate::Result;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Options for queue configuration
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub name: String,
    pub redis_url: String,
    pub key_prefix: String,
    /// Approximate cap on the events stream length.
    pub max_events: u64,
    pub limiter: Option<RateLimiterOptions>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "bull".to_string(),
            max_events: 10_000,
            limiter: None,
        }
    }
}

/// Descriptor stored in the `repeat` sorted set. Schedule evaluation is an
/// external concern; the queue only records and lists these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatableJob {
    pub name: String,
    pub every_ms: Option<u64>,
    pub pattern: Option<String>,
}

/// Redis-backed job queue handle: the producer side of the API plus the
/// administrative operations.
pub struct Queue {
    options: QueueOptions,
    store: StoreClient,
    transitions: Arc<Transitions>,
    events: EventBus,
}

impl Queue {
    pub async fn new(options: QueueOptions) -> Result<Self> {
        let connection_name = format!("{}:{}", options.key_prefix, options.name);
        let store = StoreClient::connect(&options.redis_url, &connection_name).await?;
        let keys = KeySpace::new(&options.key_prefix, &options.name);
        let scripts = Scripts::new(store.version());
        let transitions = Arc::new(Transitions::new(keys, scripts, options.max_events));

        let queue = Self {
            options,
            store,
            transitions,
            events: EventBus::default(),
        };
        queue.write_meta_options().await?;
        Ok(queue)
    }

    /// Queue-wide flags live in the meta hash; recording the events cap
    /// there is part of queue init, not of every add.
    async fn write_meta_options(&self) -> Result<()> {
        let mut conn = self.connection();
        let _: () = conn
            .hset(
                self.keys().meta(),
                "opts.maxLenEvents",
                self.options.max_events,
            )
            .await?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn keys(&self) -> &KeySpace {
        self.transitions.keys()
    }

    /// The scripted transition layer. Exposed for schedulers, workers and
    /// tests; everything it does is atomic server-side.
    pub fn transitions(&self) -> Arc<Transitions> {
        Arc::clone(&self.transitions)
    }

    pub fn store(&self) -> &StoreClient {
        &self.store
    }

    pub fn connection(&self) -> ConnectionManager {
        self.store.connection()
    }

    pub fn limiter(&self) -> Option<&RateLimiterOptions> {
        self.options.limiter.as_ref()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Enqueues one job and returns its id.
    pub async fn add(
        &self,
        name: &str,
        data: serde_json::Value,
        opts: JobOptions,
    ) -> Result<JobId> {
        let mut conn = self.connection();
        if let Some(repeat) = &opts.repeat {
            self.register_repeatable(&mut conn, name, repeat.every_ms, repeat.pattern.clone())
                .await?;
        }
        let id = self
            .transitions
            .add(&mut conn, name, &data, &opts, self.limiter())
            .await?;
        if opts.delay > 0 {
            self.events.emit(QueueEvent::Delayed {
                id: id.clone(),
                until: opts.timestamp.unwrap_or_else(now_ms) + opts.delay as i64,
            });
        } else if !opts.wait_children {
            self.events.emit(QueueEvent::Waiting { id: id.clone() });
        }
        Ok(id)
    }

    /// Enqueues a batch. Each add is individually atomic; a failure aborts
    /// the remainder, leaving the earlier adds committed.
    pub async fn add_bulk(
        &self,
        jobs: Vec<(String, serde_json::Value, JobOptions)>,
    ) -> Result<Vec<JobId>> {
        let mut ids = Vec::with_capacity(jobs.len());
        for (name, data, opts) in jobs {
            ids.push(self.add(&name, data, opts).await?);
        }
        Ok(ids)
    }

    pub async fn pause(&self) -> Result<()> {
        let mut conn = self.connection();
        self.transitions.pause(&mut conn, true).await?;
        self.events.emit(QueueEvent::Paused);
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        let mut conn = self.connection();
        self.transitions.pause(&mut conn, false).await?;
        self.events.emit(QueueEvent::Resumed);
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool> {
        let mut conn = self.connection();
        let paused: bool = conn.hexists(self.keys().meta(), "paused").await?;
        Ok(paused)
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>> {
        let mut conn = self.connection();
        let fields: HashMap<String, String> =
            conn.hgetall(self.keys().job(job_id.as_str())).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(JobRecord::from_hash(job_id.clone(), fields)?))
    }

    pub async fn get_state(&self, job_id: &JobId) -> Result<JobState> {
        let mut conn = self.connection();
        self.transitions.get_state(&mut conn, job_id).await
    }

    /// Jobs in the given states, `start..=end` per state, oldest-first when
    /// `asc`.
    pub async fn get_jobs(
        &self,
        states: &[JobState],
        start: isize,
        end: isize,
        asc: bool,
    ) -> Result<Vec<JobRecord>> {
        let mut conn = self.connection();
        let mut records = Vec::new();
        for state in states {
            for id in self.ids_in_state(&mut conn, *state, start, end, asc).await? {
                let fields: HashMap<String, String> =
                    conn.hgetall(self.keys().job(&id)).await?;
                if !fields.is_empty() {
                    records.push(JobRecord::from_hash(JobId(id), fields)?);
                }
            }
        }
        Ok(records)
    }

    async fn ids_in_state(
        &self,
        conn: &mut ConnectionManager,
        state: JobState,
        start: isize,
        end: isize,
        asc: bool,
    ) -> Result<Vec<String>> {
        let keys = self.keys();
        let ids: Vec<String> = match state {
            JobState::Waiting => conn.lrange(keys.wait(), start, end).await?,
            JobState::Paused => conn.lrange(keys.paused(), start, end).await?,
            JobState::Active => conn.lrange(keys.active(), start, end).await?,
            JobState::WaitingChildren => conn.smembers(keys.waiting_children()).await?,
            JobState::Delayed => {
                if asc {
                    conn.zrange(keys.delayed(), start, end).await?
                } else {
                    redis::cmd("ZREVRANGE")
                        .arg(keys.delayed())
                        .arg(start)
                        .arg(end)
                        .query_async(conn)
                        .await?
                }
            }
            JobState::Completed | JobState::Failed => {
                let key = if state == JobState::Completed {
                    keys.completed()
                } else {
                    keys.failed()
                };
                if asc {
                    conn.zrange(key, start, end).await?
                } else {
                    redis::cmd("ZREVRANGE")
                        .arg(key)
                        .arg(start)
                        .arg(end)
                        .query_async(conn)
                        .await?
                }
            }
            JobState::Unknown => Vec::new(),
        };
        Ok(ids)
    }

    /// Counts per state, fetched in one pipelined round-trip.
    pub async fn get_job_counts(&self) -> Result<HashMap<JobState, u64>> {
        let mut conn = self.connection();
        let keys = self.keys();
        let (waiting, paused, active, delayed, completed, failed, waiting_children): (
            u64,
            u64,
            u64,
            u64,
            u64,
            u64,
            u64,
        ) = redis::pipe()
            .llen(keys.wait())
            .llen(keys.paused())
            .llen(keys.active())
            .zcard(keys.delayed())
            .zcard(keys.completed())
            .zcard(keys.failed())
            .scard(keys.waiting_children())
            .query_async(&mut conn)
            .await?;
        let mut counts = HashMap::new();
        counts.insert(JobState::Waiting, waiting);
        counts.insert(JobState::Paused, paused);
        counts.insert(JobState::Active, active);
        counts.insert(JobState::Delayed, delayed);
        counts.insert(JobState::Completed, completed);
        counts.insert(JobState::Failed, failed);
        counts.insert(JobState::WaitingChildren, waiting_children);
        Ok(counts)
    }

    /// Jobs still headed for a worker: ready, parked behind pause, or
    /// delayed.
    pub async fn count(&self) -> Result<u64> {
        let counts = self.get_job_counts().await?;
        Ok(counts.get(&JobState::Waiting).copied().unwrap_or(0)
            + counts.get(&JobState::Paused).copied().unwrap_or(0)
            + counts.get(&JobState::Delayed).copied().unwrap_or(0))
    }

    /// Removes jobs finished (or created) before `now - grace_ms` from one
    /// state set, up to `limit` (0 = no limit). Returns the removed ids.
    pub async fn clean(
        &self,
        grace_ms: i64,
        limit: i64,
        target: CleanTarget,
    ) -> Result<Vec<JobId>> {
        let mut conn = self.connection();
        let cutoff = now_ms() - grace_ms;
        self.transitions
            .clean_jobs_in_set(&mut conn, target, cutoff, limit)
            .await
    }

    /// Atomically empties the ready queues; with `include_delayed` the
    /// delayed set goes too. In-flight active jobs are untouched.
    pub async fn drain(&self, include_delayed: bool) -> Result<u64> {
        let mut conn = self.connection();
        let dropped = self.transitions.drain(&mut conn, include_delayed).await?;
        self.events.emit(QueueEvent::Drained);
        Ok(dropped)
    }

    /// Completely destroys the queue, `count` jobs per script call. The
    /// queue must be paused; active jobs refuse removal unless `force`.
    pub async fn obliterate(&self, force: bool, count: u32) -> Result<()> {
        let mut conn = self.connection();
        let count = count.max(1);
        while self.transitions.obliterate(&mut conn, count, force).await? {}
        Ok(())
    }

    pub async fn remove(&self, job_id: &JobId) -> Result<()> {
        let mut conn = self.connection();
        self.transitions.remove(&mut conn, job_id).await?;
        self.events.emit(QueueEvent::Removed { id: job_id.clone() });
        Ok(())
    }

    pub async fn promote(&self, job_id: &JobId) -> Result<()> {
        let mut conn = self.connection();
        self.transitions.promote(&mut conn, job_id).await
    }

    /// Puts a failed job back on the ready queue.
    pub async fn retry(&self, job_id: &JobId) -> Result<()> {
        self.reprocess(job_id, JobState::Failed).await
    }

    /// Puts a completed or failed job back on the ready queue.
    pub async fn reprocess(&self, job_id: &JobId, state: JobState) -> Result<()> {
        let mut conn = self.connection();
        self.transitions
            .reprocess_job(&mut conn, job_id, state, false)
            .await
    }

    pub async fn update_progress(
        &self,
        job_id: &JobId,
        progress: serde_json::Value,
    ) -> Result<()> {
        let mut conn = self.connection();
        self.transitions
            .update_progress(&mut conn, job_id, &progress)
            .await?;
        self.events.emit(QueueEvent::Progress {
            id: job_id.clone(),
            progress,
        });
        Ok(())
    }

    /// Caps the events stream to roughly `max` entries.
    pub async fn trim_events(&self, max: u64) -> Result<()> {
        let mut conn = self.connection();
        let trim: redis::RedisResult<i64> = redis::cmd("XTRIM")
            .arg(self.keys().events())
            .arg("MAXLEN")
            .arg("~")
            .arg(max)
            .query_async(&mut conn)
            .await;
        if let Err(err) = trim {
            // event housekeeping must never fail the caller
            warn!("failed to trim events stream: {}", err);
        }
        Ok(())
    }

    async fn register_repeatable(
        &self,
        conn: &mut ConnectionManager,
        name: &str,
        every_ms: Option<u64>,
        pattern: Option<String>,
    ) -> Result<()> {
        let descriptor = RepeatableJob {
            name: name.to_string(),
            every_ms,
            pattern,
        };
        let member = serde_json::to_string(&descriptor)?;
        let next = now_ms() + every_ms.unwrap_or(0) as i64;
        let _: () = conn.zadd(self.keys().repeat(), member, next).await?;
        Ok(())
    }

    pub async fn get_repeatable_jobs(&self) -> Result<Vec<(RepeatableJob, i64)>> {
        let mut conn = self.connection();
        let raw: Vec<(String, i64)> = redis::cmd("ZRANGE")
            .arg(self.keys().repeat())
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        let mut out = Vec::with_capacity(raw.len());
        for (member, next) in raw {
            match serde_json::from_str(&member) {
                Ok(descriptor) => out.push((descriptor, next)),
                Err(err) => warn!("skipping malformed repeatable entry: {}", err),
            }
        }
        Ok(out)
    }

    pub async fn remove_repeatable(&self, descriptor: &RepeatableJob) -> Result<bool> {
        let mut conn = self.connection();
        let member = serde_json::to_string(descriptor)?;
        let removed: u64 = conn.zrem(self.keys().repeat(), member).await?;
        Ok(removed > 0)
    }

    /// All keys currently held under this queue's prefix.
    pub async fn owned_keys(&self) -> Result<Vec<String>> {
        let mut conn = self.connection();
        StoreClient::scan_keys(&mut conn, &self.keys().scan_pattern()).await
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.options.name)
            .field("prefix", &self.options.key_prefix)
            .finish()
    }
}
