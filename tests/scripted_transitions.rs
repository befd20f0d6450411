//! Integration tests for the scripted transitions. They drive a real Redis
//! instance and are ignored by default; run with
//! `cargo test -- --ignored` against a disposable server.

use serde_json::json;
use switchyard::{
    ActiveClaim, FinishTarget, JobId, JobOptions, JobState, ParentRef, Queue, QueueOptions,
    SwitchyardError,
};

const REDIS_URL: &str = "redis://127.0.0.1:6379";
const LOCK_MS: u64 = 30_000;

fn unique(name: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{}-{}", name, nanos)
}

async fn open(name: &str) -> Queue {
    tracing_subscriber::fmt::try_init().ok();
    Queue::new(QueueOptions {
        name: unique(name),
        redis_url: REDIS_URL.to_string(),
        key_prefix: "switchyard-test".to_string(),
        max_events: 1_000,
        limiter: None,
    })
    .await
    .expect("redis must be reachable")
}

async fn destroy(queue: &Queue) {
    queue.pause().await.ok();
    queue.obliterate(true, 1_000).await.ok();
}

async fn claim(queue: &Queue, token: &str) -> ActiveClaim {
    let transitions = queue.transitions();
    let mut conn = queue.connection();
    transitions
        .move_to_active(&mut conn, token, None, LOCK_MS, None)
        .await
        .unwrap()
}

fn claimed_id(claim: ActiveClaim) -> JobId {
    match claim {
        ActiveClaim::Claimed(record) => record.id,
        other => panic!("expected a claimed job, got {:?}", other),
    }
}

async fn complete(queue: &Queue, id: &JobId, token: &str) {
    let transitions = queue.transitions();
    let mut conn = queue.connection();
    transitions
        .move_to_finished(
            &mut conn,
            id,
            token,
            &FinishTarget::Completed {
                returnvalue: json!(null),
            },
            -1,
            false,
            LOCK_MS,
            None,
        )
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn priority_governs_claim_order_with_insertion_tiebreak() {
    let queue = open("prio").await;

    let opts = |priority| JobOptions {
        priority,
        ..JobOptions::default()
    };
    let a = queue.add("t", json!({"job": "a"}), opts(2)).await.unwrap();
    let b = queue.add("t", json!({"job": "b"}), opts(1)).await.unwrap();
    let c = queue.add("t", json!({"job": "c"}), opts(1)).await.unwrap();

    assert_eq!(claimed_id(claim(&queue, "tok-1").await), b);
    assert_eq!(claimed_id(claim(&queue, "tok-2").await), c);
    assert_eq!(claimed_id(claim(&queue, "tok-3").await), a);
    assert!(matches!(
        claim(&queue, "tok-4").await,
        ActiveClaim::Idle
    ));

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn priority_ties_hold_across_id_digit_boundaries() {
    let queue = open("prio-digits").await;

    // ids "9" and "10" sort the wrong way round as strings; insertion
    // order must win for equal priorities regardless
    let with_id = |id: &str, priority: u32| JobOptions {
        job_id: Some(id.to_string()),
        priority,
        ..JobOptions::default()
    };
    let nine = queue.add("t", json!({}), with_id("9", 5)).await.unwrap();
    let ten = queue.add("t", json!({}), with_id("10", 5)).await.unwrap();
    let eleven = queue.add("t", json!({}), with_id("11", 5)).await.unwrap();
    let urgent = queue.add("t", json!({}), with_id("100", 1)).await.unwrap();

    assert_eq!(claimed_id(claim(&queue, "tok-1").await), urgent);
    assert_eq!(claimed_id(claim(&queue, "tok-2").await), nine);
    assert_eq!(claimed_id(claim(&queue, "tok-3").await), ten);
    assert_eq!(claimed_id(claim(&queue, "tok-4").await), eleven);

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn lifo_jobs_are_claimed_newest_first() {
    let queue = open("lifo").await;

    let first = queue
        .add("t", json!({}), JobOptions::default())
        .await
        .unwrap();
    let second = queue
        .add(
            "t",
            json!({}),
            JobOptions {
                lifo: true,
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(claimed_id(claim(&queue, "tok-1").await), second);
    assert_eq!(claimed_id(claim(&queue, "tok-2").await), first);

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn delayed_jobs_promote_exactly_at_their_due_time() {
    let queue = open("delay").await;
    let transitions = queue.transitions();
    let mut conn = queue.connection();

    let base = chrono::Utc::now().timestamp_millis();
    let id = queue
        .add(
            "t",
            json!({}),
            JobOptions {
                delay: 100,
                timestamp: Some(base),
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();
    let due = base + 100;

    // half way there: nothing ready, and the pump learns the next deadline
    assert!(matches!(claim(&queue, "tok-1").await, ActiveClaim::Idle));
    let next = transitions
        .update_delay_set(&mut conn, due - 50)
        .await
        .unwrap()
        .expect("one delayed entry");
    assert_eq!(switchyard::job::delay_score_timestamp(next), due);
    assert_eq!(queue.get_state(&id).await.unwrap(), JobState::Delayed);

    // at the boundary the entry is promoted
    let next = transitions.update_delay_set(&mut conn, due).await.unwrap();
    assert!(next.is_none());
    assert_eq!(queue.get_state(&id).await.unwrap(), JobState::Waiting);
    assert_eq!(claimed_id(claim(&queue, "tok-2").await), id);

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn stale_tokens_never_refresh_a_lock() {
    let queue = open("lock").await;
    let transitions = queue.transitions();
    let mut conn = queue.connection();

    queue
        .add("t", json!({}), JobOptions::default())
        .await
        .unwrap();
    let id = claimed_id(claim(&queue, "tok-owner").await);

    assert!(!transitions
        .extend_lock(&mut conn, &id, "tok-imposter", LOCK_MS)
        .await
        .unwrap());
    assert!(transitions
        .extend_lock(&mut conn, &id, "tok-owner", LOCK_MS)
        .await
        .unwrap());

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn stalled_job_is_recovered_back_to_wait() {
    let queue = open("stall").await;
    let transitions = queue.transitions();
    let mut conn = queue.connection();

    queue
        .add("t", json!({}), JobOptions::default())
        .await
        .unwrap();
    let id = match transitions
        .move_to_active(&mut conn, "tok-crash", None, 100, None)
        .await
        .unwrap()
    {
        ActiveClaim::Claimed(record) => record.id,
        other => panic!("expected a claim, got {:?}", other),
    };

    // the worker dies: no renewals, the 100ms lock expires
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;

    // first sweep marks the lockless active job, second sweep recovers it
    let (failed, recovered) = transitions
        .move_stalled_jobs(&mut conn, 1, 50)
        .await
        .unwrap();
    assert!(failed.is_empty() && recovered.is_empty());
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    let (failed, recovered) = transitions
        .move_stalled_jobs(&mut conn, 1, 50)
        .await
        .unwrap();
    assert!(failed.is_empty());
    assert_eq!(recovered, vec![id.clone()]);

    assert_eq!(queue.get_state(&id).await.unwrap(), JobState::Waiting);
    let record = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.stalled_counter, 1);

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn repeatedly_stalling_job_is_failed() {
    let queue = open("stall-fail").await;
    let transitions = queue.transitions();
    let mut conn = queue.connection();

    queue
        .add("t", json!({}), JobOptions::default())
        .await
        .unwrap();
    let id = match transitions
        .move_to_active(&mut conn, "tok-crash", None, 100, None)
        .await
        .unwrap()
    {
        ActiveClaim::Claimed(record) => record.id,
        other => panic!("expected a claim, got {:?}", other),
    };

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    transitions
        .move_stalled_jobs(&mut conn, 0, 50)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    let (failed, recovered) = transitions
        .move_stalled_jobs(&mut conn, 0, 50)
        .await
        .unwrap();
    assert_eq!(failed, vec![id.clone()]);
    assert!(recovered.is_empty());

    assert_eq!(queue.get_state(&id).await.unwrap(), JobState::Failed);
    let record = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(
        record.failed_reason.as_deref(),
        Some("job stalled more than allowable limit")
    );

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn failing_job_retries_through_delayed_then_lands_in_failed() {
    let queue = open("retry").await;
    let transitions = queue.transitions();
    let mut conn = queue.connection();

    let id = queue
        .add(
            "t",
            json!({}),
            JobOptions {
                attempts: 2,
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();

    // first attempt fails; attempts remain, so the job backs off
    let record = match claim(&queue, "tok-1").await {
        ActiveClaim::Claimed(record) => record,
        other => panic!("expected a claim, got {:?}", other),
    };
    assert_eq!(record.attempts_made, 1);
    let wake = chrono::Utc::now().timestamp_millis() + 50;
    transitions
        .move_to_delayed(&mut conn, &id, Some("tok-1"), wake)
        .await
        .unwrap();
    assert_eq!(queue.get_state(&id).await.unwrap(), JobState::Delayed);

    // backoff elapses, second attempt fails for good
    transitions
        .update_delay_set(&mut conn, wake + 1)
        .await
        .unwrap();
    let record = match claim(&queue, "tok-2").await {
        ActiveClaim::Claimed(record) => record,
        other => panic!("expected a claim, got {:?}", other),
    };
    assert_eq!(record.attempts_made, 2);
    transitions
        .move_to_finished(
            &mut conn,
            &id,
            "tok-2",
            &FinishTarget::Failed {
                reason: "boom".to_string(),
            },
            -1,
            false,
            LOCK_MS,
            None,
        )
        .await
        .unwrap();

    assert_eq!(queue.get_state(&id).await.unwrap(), JobState::Failed);
    let record = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.failed_reason.as_deref(), Some("boom"));

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn finishing_the_last_child_releases_the_parent() {
    let queue = open("flow").await;

    // children are registered first so the parent parks at add time
    let child = queue
        .add(
            "child",
            json!({}),
            JobOptions {
                parent: Some(ParentRef {
                    id: "P".to_string(),
                    queue: queue.name().to_string(),
                }),
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();
    let parent = queue
        .add(
            "parent",
            json!({}),
            JobOptions {
                job_id: Some("P".to_string()),
                wait_children: true,
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        queue.get_state(&parent).await.unwrap(),
        JobState::WaitingChildren
    );

    let claimed = claimed_id(claim(&queue, "tok-1").await);
    assert_eq!(claimed, child);
    complete(&queue, &child, "tok-1").await;

    assert_eq!(queue.get_state(&parent).await.unwrap(), JobState::Waiting);
    assert_eq!(claimed_id(claim(&queue, "tok-2").await), parent);

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn completing_a_parent_with_pending_children_is_refused() {
    let queue = open("flow-park").await;
    let transitions = queue.transitions();
    let mut conn = queue.connection();

    let parent = queue
        .add(
            "parent",
            json!({}),
            JobOptions {
                job_id: Some("P".to_string()),
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();
    let claimed = claimed_id(claim(&queue, "tok-p").await);
    assert_eq!(claimed, parent);

    // a child arrives while the parent is processing
    let child = queue
        .add(
            "child",
            json!({}),
            JobOptions {
                parent: Some(ParentRef {
                    id: "P".to_string(),
                    queue: queue.name().to_string(),
                }),
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();

    let err = transitions
        .move_to_finished(
            &mut conn,
            &parent,
            "tok-p",
            &FinishTarget::Completed {
                returnvalue: json!(null),
            },
            -1,
            false,
            LOCK_MS,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SwitchyardError::PendingDependencies(_)));

    assert!(transitions
        .move_to_waiting_children(&mut conn, &parent, "tok-p")
        .await
        .unwrap());
    assert_eq!(
        queue.get_state(&parent).await.unwrap(),
        JobState::WaitingChildren
    );

    // the child finishing releases the parent again
    let claimed = claimed_id(claim(&queue, "tok-c").await);
    assert_eq!(claimed, child);
    complete(&queue, &child, "tok-c").await;
    assert_eq!(queue.get_state(&parent).await.unwrap(), JobState::Waiting);

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn pause_blocks_claims_and_resume_restores_them() {
    let queue = open("pause").await;

    let id = queue
        .add("t", json!({}), JobOptions::default())
        .await
        .unwrap();

    queue.pause().await.unwrap();
    assert!(queue.is_paused().await.unwrap());
    assert!(matches!(claim(&queue, "tok-1").await, ActiveClaim::Idle));

    // adds while paused park in the paused list
    let late = queue
        .add("t", json!({}), JobOptions::default())
        .await
        .unwrap();
    assert_eq!(queue.get_state(&late).await.unwrap(), JobState::Paused);

    queue.resume().await.unwrap();
    assert!(!queue.is_paused().await.unwrap());
    assert_eq!(claimed_id(claim(&queue, "tok-2").await), id);
    assert_eq!(claimed_id(claim(&queue, "tok-3").await), late);

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn add_then_remove_leaves_only_queue_bookkeeping() {
    let queue = open("remove").await;

    let id = queue
        .add("t", json!({"x": 1}), JobOptions::default())
        .await
        .unwrap();
    queue.remove(&id).await.unwrap();

    assert!(queue.get_job(&id).await.unwrap().is_none());
    let mut names: Vec<String> = queue
        .owned_keys()
        .await
        .unwrap()
        .into_iter()
        .map(|k| k.trim_start_matches(queue.keys().base()).to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["events".to_string(), "meta".to_string()]);

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn removing_a_locked_job_is_refused() {
    let queue = open("remove-locked").await;

    queue
        .add("t", json!({}), JobOptions::default())
        .await
        .unwrap();
    let id = claimed_id(claim(&queue, "tok-1").await);

    let err = queue.remove(&id).await.unwrap_err();
    assert!(matches!(err, SwitchyardError::LockLost(_)));

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn obliterate_requires_pause_and_refuses_active_jobs() {
    let queue = open("obliterate").await;

    queue
        .add("t", json!({}), JobOptions::default())
        .await
        .unwrap();
    let id = claimed_id(claim(&queue, "tok-1").await);

    let err = queue.obliterate(false, 100).await.unwrap_err();
    assert!(matches!(err, SwitchyardError::QueueNotPaused));

    queue.pause().await.unwrap();
    let err = queue.obliterate(false, 100).await.unwrap_err();
    assert!(matches!(err, SwitchyardError::ActiveJobs));

    // drain the active job, then destruction goes through
    complete(&queue, &id, "tok-1").await;
    queue.obliterate(false, 100).await.unwrap();
    assert!(queue.owned_keys().await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn rate_limited_claims_report_the_remaining_window() {
    let queue = Queue::new(QueueOptions {
        name: unique("limit"),
        redis_url: REDIS_URL.to_string(),
        key_prefix: "switchyard-test".to_string(),
        max_events: 1_000,
        limiter: Some(switchyard::RateLimiterOptions {
            max: 1,
            duration_ms: 60_000,
            group_key: None,
        }),
    })
    .await
    .unwrap();
    let transitions = queue.transitions();
    let mut conn = queue.connection();

    queue
        .add("t", json!({}), JobOptions::default())
        .await
        .unwrap();
    queue
        .add("t", json!({}), JobOptions::default())
        .await
        .unwrap();

    let first = transitions
        .move_to_active(&mut conn, "tok-1", None, LOCK_MS, queue.limiter())
        .await
        .unwrap();
    assert!(matches!(first, ActiveClaim::Claimed(_)));

    match transitions
        .move_to_active(&mut conn, "tok-2", None, LOCK_MS, queue.limiter())
        .await
        .unwrap()
    {
        ActiveClaim::RateLimited { delay_ms } => {
            assert!(delay_ms > 0 && delay_ms <= 60_000)
        }
        other => panic!("expected rate limiting, got {:?}", other),
    }

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn drain_empties_ready_queues_and_optionally_delayed() {
    let queue = open("drain").await;

    queue
        .add("t", json!({}), JobOptions::default())
        .await
        .unwrap();
    queue
        .add("t", json!({}), JobOptions::default())
        .await
        .unwrap();
    let delayed = queue
        .add(
            "t",
            json!({}),
            JobOptions {
                delay: 60_000,
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(queue.drain(false).await.unwrap(), 2);
    assert_eq!(queue.get_state(&delayed).await.unwrap(), JobState::Delayed);
    assert_eq!(queue.drain(true).await.unwrap(), 1);
    assert_eq!(queue.get_state(&delayed).await.unwrap(), JobState::Unknown);

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn reprocessing_a_completed_job_requeues_it() {
    let queue = open("reprocess").await;

    let id = queue
        .add("t", json!({}), JobOptions::default())
        .await
        .unwrap();
    let claimed = claimed_id(claim(&queue, "tok-1").await);
    assert_eq!(claimed, id);
    complete(&queue, &id, "tok-1").await;
    assert_eq!(queue.get_state(&id).await.unwrap(), JobState::Completed);

    queue.reprocess(&id, JobState::Completed).await.unwrap();
    assert_eq!(queue.get_state(&id).await.unwrap(), JobState::Waiting);

    let missing = queue
        .reprocess(&JobId::from("no-such-job"), JobState::Completed)
        .await
        .unwrap_err();
    assert!(matches!(missing, SwitchyardError::MissingJob(_)));

    destroy(&queue).await;
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn finish_with_fetch_next_chains_into_the_next_job() {
    let queue = open("chain").await;
    let transitions = queue.transitions();
    let mut conn = queue.connection();

    let first = queue
        .add("t", json!({}), JobOptions::default())
        .await
        .unwrap();
    let second = queue
        .add("t", json!({}), JobOptions::default())
        .await
        .unwrap();

    let claimed = claimed_id(claim(&queue, "tok-1").await);
    assert_eq!(claimed, first);

    let next = transitions
        .move_to_finished(
            &mut conn,
            &first,
            "tok-1",
            &FinishTarget::Completed {
                returnvalue: json!("done"),
            },
            -1,
            true,
            LOCK_MS,
            None,
        )
        .await
        .unwrap()
        .expect("second job should be fetched inline");
    assert_eq!(next.id, second);
    assert_eq!(queue.get_state(&second).await.unwrap(), JobState::Active);

    destroy(&queue).await;
}
