// src/scheduler.rs
//! Background maintenance for a queue: the delay pump that promotes due
//! delayed jobs and the stall monitor that recovers jobs from dead
//! workers. One scheduler per queue is enough; concurrent schedulers are
//! safe but wasteful, since the scripts themselves serialize.

use crate::client::StoreClient;
use crate::events::QueueEvent;
use crate::job::delay_score_timestamp;
use crate::queue::{Queue, QueueOptions};
use crate::transitions::now_ms;
use crate::Result;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{
    task::JoinHandle,
    time::{interval, sleep, Duration},
};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub queue_options: QueueOptions,
    /// Sweep cadence for the stall monitor; keep it at or under half the
    /// workers' lock duration.
    pub stalled_interval: Duration,
    /// How many times a job may stall before it is failed outright.
    pub max_stalled_count: u32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            queue_options: QueueOptions::default(),
            stalled_interval: Duration::from_secs(30),
            max_stalled_count: 1,
        }
    }
}

/// Owns the delay pump and stall monitor loops for one queue.
pub struct QueueScheduler {
    options: SchedulerOptions,
    queue: Arc<Queue>,
    handles: Vec<JoinHandle<()>>,
    is_shutting_down: Arc<AtomicBool>,
}

impl QueueScheduler {
    pub async fn new(options: SchedulerOptions) -> Result<Self> {
        let queue = Arc::new(Queue::new(options.queue_options.clone()).await?);
        Ok(Self {
            options,
            queue,
            handles: Vec::new(),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn queue(&self) -> Arc<Queue> {
        Arc::clone(&self.queue)
    }

    /// Spawns both loops and returns immediately.
    pub fn start(&mut self) {
        info!(
            "Starting scheduler for queue {}",
            self.options.queue_options.name
        );
        let queue = Arc::clone(&self.queue);
        let shutdown = Arc::clone(&self.is_shutting_down);
        self.handles
            .push(tokio::spawn(delay_pump(queue, shutdown)));

        let queue = Arc::clone(&self.queue);
        let shutdown = Arc::clone(&self.is_shutting_down);
        let stalled_interval = self.options.stalled_interval;
        let max_stalled_count = self.options.max_stalled_count;
        self.handles.push(tokio::spawn(stall_monitor(
            queue,
            shutdown,
            stalled_interval,
            max_stalled_count,
        )));
    }

    pub fn stop(&mut self) {
        self.is_shutting_down.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        info!(
            "Scheduler for queue {} stopped",
            self.options.queue_options.name
        );
    }
}

impl Drop for QueueScheduler {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

/// Sleep when the delayed set is empty and no marker arrives.
const PUMP_IDLE_SECS: f64 = 5.0;

/// Promotes due delayed jobs, then sleeps until the next entry is due. An
/// add that inserts an earlier entry pushes the wake marker, which cuts
/// the sleep short.
async fn delay_pump(queue: Arc<Queue>, shutdown: Arc<AtomicBool>) {
    let transitions = queue.transitions();
    let marker_key = transitions.keys().marker();
    let mut conn = queue.connection();

    let mut blocking = loop {
        match queue.store().blocking_connection().await {
            Ok(conn) => break conn,
            Err(err) => {
                error!("delay pump failed to open blocking connection: {}", err);
                sleep(Duration::from_secs(1)).await;
            }
        }
    };

    while !shutdown.load(Ordering::SeqCst) {
        let wait_secs = match transitions.update_delay_set(&mut conn, now_ms()).await {
            Ok(Some(next_score)) => {
                let due_in_ms = delay_score_timestamp(next_score) - now_ms();
                if due_in_ms <= 0 {
                    // already due again; promote on the next pass
                    continue;
                }
                (due_in_ms as f64 / 1000.0).max(0.01)
            }
            Ok(None) => PUMP_IDLE_SECS,
            Err(err) => {
                error!("failed to promote delayed jobs: {}", err);
                sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        if let Err(err) = StoreClient::brpop(&mut blocking, &marker_key, wait_secs).await {
            warn!("delay marker wait failed: {}", err);
            sleep(Duration::from_secs(1)).await;
        }
    }
}

/// Periodically recovers active jobs whose locks expired. The script's
/// stalled-check guard keeps concurrent monitors down to one sweep per
/// interval.
async fn stall_monitor(
    queue: Arc<Queue>,
    shutdown: Arc<AtomicBool>,
    stalled_interval: Duration,
    max_stalled_count: u32,
) {
    let transitions = queue.transitions();
    let mut conn = queue.connection();
    let mut ticker = interval(stalled_interval);

    loop {
        ticker.tick().await;
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match transitions
            .move_stalled_jobs(
                &mut conn,
                max_stalled_count,
                stalled_interval.as_millis() as u64,
            )
            .await
        {
            Ok((failed, recovered)) => {
                for id in &recovered {
                    warn!("job {} stalled; returned to wait", id);
                    queue.events().emit(QueueEvent::Stalled { id: id.clone() });
                }
                for id in &failed {
                    error!("job {} stalled more than allowable limit", id);
                    queue.events().emit(QueueEvent::Failed {
                        id: id.clone(),
                        reason: "job stalled more than allowable limit".to_string(),
                    });
                }
            }
            Err(err) => error!("stall sweep failed: {}", err),
        }
    }
}
