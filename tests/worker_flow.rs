//! End-to-end worker tests: real Redis, a live worker loop and a scheduler.
//! Ignored by default; run with `cargo test -- --ignored`.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use switchyard::{
    async_trait, AppContext, BackoffStrategy, Job, JobContext, JobOptions, JobState, QueueEvent,
    QueueScheduler, Result, SchedulerOptions, WorkerBuilder,
};

const REDIS_URL: &str = "redis://127.0.0.1:6379";

fn unique(name: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{}-{}", name, nanos)
}

#[derive(Clone, Default)]
struct TestCtx;

impl AppContext for TestCtx {
    fn clone_context(&self) -> Arc<dyn AppContext> {
        Arc::new(self.clone())
    }
}

#[derive(Serialize, Deserialize)]
struct EchoJob {
    value: u64,
}

#[async_trait]
impl Job for EchoJob {
    async fn perform(&self, ctx: &JobContext) -> Result<serde_json::Value> {
        ctx.update_progress(json!(100)).await?;
        Ok(json!(self.value))
    }

    fn name() -> &'static str {
        "EchoJob"
    }
}

#[derive(Serialize, Deserialize)]
struct AlwaysFails;

#[async_trait]
impl Job for AlwaysFails {
    async fn perform(&self, _ctx: &JobContext) -> Result<serde_json::Value> {
        Err(anyhow::anyhow!("nope").into())
    }

    fn name() -> &'static str {
        "AlwaysFails"
    }

    fn default_options() -> JobOptions {
        JobOptions {
            attempts: 2,
            backoff: Some(BackoffStrategy::Fixed { delay: 50 }),
            ..JobOptions::default()
        }
    }
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn worker_processes_jobs_and_reports_completion() {
    let queue_name = unique("e2e");
    let mut registry = switchyard::JobRegistry::new();
    registry.register::<EchoJob>();

    let worker = WorkerBuilder::new(REDIS_URL, registry)
        .with_queue_name(&queue_name)
        .with_concurrency(4)
        .with_drain_delay(Duration::from_millis(200))
        .with_app_context(Arc::new(TestCtx))
        .spawn()
        .await
        .unwrap();
    let queue = worker.queue();
    let mut events = worker.subscribe();

    let mut worker = worker;
    let worker_task = tokio::spawn(async move { worker.start().await });

    for value in 0..3u64 {
        queue
            .add("EchoJob", json!({ "value": value }), JobOptions::default())
            .await
            .unwrap();
    }

    let mut completed = 0;
    tokio::time::timeout(Duration::from_secs(15), async {
        while completed < 3 {
            if let Ok(QueueEvent::Completed { .. }) = events.recv().await {
                completed += 1;
            }
        }
    })
    .await
    .expect("jobs should complete in time");

    let counts = queue.get_job_counts().await.unwrap();
    assert_eq!(counts[&JobState::Completed], 3);
    assert_eq!(counts[&JobState::Waiting], 0);
    assert_eq!(counts[&JobState::Active], 0);

    worker_task.abort();
    queue.pause().await.ok();
    queue.obliterate(true, 1_000).await.ok();
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn failing_job_is_retried_with_backoff_then_failed() {
    let queue_name = unique("e2e-retry");
    let mut registry = switchyard::JobRegistry::new();
    registry.register::<AlwaysFails>();

    // the scheduler's delay pump promotes the backoff retry
    let mut scheduler = QueueScheduler::new(SchedulerOptions {
        queue_options: switchyard::QueueOptions {
            name: queue_name.clone(),
            redis_url: REDIS_URL.to_string(),
            ..switchyard::QueueOptions::default()
        },
        stalled_interval: Duration::from_secs(5),
        max_stalled_count: 1,
    })
    .await
    .unwrap();
    scheduler.start();

    let worker = WorkerBuilder::new(REDIS_URL, registry)
        .with_queue_name(&queue_name)
        .with_drain_delay(Duration::from_millis(200))
        .with_app_context(Arc::new(TestCtx))
        .spawn()
        .await
        .unwrap();
    let queue = worker.queue();
    let mut events = worker.subscribe();

    let mut worker = worker;
    let worker_task = tokio::spawn(async move { worker.start().await });

    let id = queue
        .add("AlwaysFails", json!({}), AlwaysFails::default_options())
        .await
        .unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if let Ok(QueueEvent::Failed { id: failed, reason }) = events.recv().await {
                if failed == id {
                    return reason;
                }
            }
        }
    })
    .await
    .expect("the final attempt should fail in time");
    assert!(reason.contains("nope"));

    let record = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.attempts_made, 2);
    assert_eq!(queue.get_state(&id).await.unwrap(), JobState::Failed);

    worker_task.abort();
    scheduler.stop();
    queue.pause().await.ok();
    queue.obliterate(true, 1_000).await.ok();
}
