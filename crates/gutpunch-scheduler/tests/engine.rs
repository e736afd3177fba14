use std::sync::{Arc, Mutex};

use chrono::Utc;
use gutpunch_scheduler::{
    async_handler_fn, handler_fn, EngineSettings, EnqueueOptions, Filter, Gateway, JobStatus,
    JobUpdate, Parameters, SchedulerEngine, SchedulerError,
};
use serde_json::json;

fn engine_with(settings: EngineSettings) -> Arc<SchedulerEngine> {
    let gateway = Arc::new(Gateway::open_in_memory().unwrap());
    Arc::new(SchedulerEngine::new(gateway, settings))
}

fn engine() -> Arc<SchedulerEngine> {
    engine_with(EngineSettings::default())
}

fn params(value: serde_json::Value) -> Parameters {
    value.as_object().cloned().expect("object literal")
}

#[tokio::test]
async fn job_without_handler_fails_once() {
    let engine = engine();
    let job = engine
        .enqueue("t1", params(json!({"x": 1})), EnqueueOptions::now())
        .unwrap();

    let report = engine.tick().await.unwrap();
    assert_eq!(report.selected, 1);
    assert_eq!(report.failed, 1);

    let job = engine.jobs().get_single(job.job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retries, 1);
    assert!(job.started_at.is_none(), "never passed through RUNNING");
    let error = job.error().expect("error recorded");
    assert!(error.contains("No handler registered"));
    assert!(error.contains("t1"));
}

#[tokio::test]
async fn successful_handler_completes_job() {
    let engine = engine();
    let job = engine
        .perform_now("t2", handler_fn(|_| Ok(())), Parameters::new())
        .unwrap()
        .unwrap();
    assert!(job.scheduled_time <= Utc::now());

    let report = engine.tick().await.unwrap();
    assert_eq!(report.completed, 1);

    let job = engine.jobs().get_single(job.job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retries, 0);
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn updated_at_strictly_increases_through_lifecycle() {
    let engine = engine();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let jobs = engine.jobs().clone();
    let sink = Arc::clone(&seen);
    let job = engine
        .perform_now(
            "observe",
            handler_fn(move |_| {
                let running = jobs.get_jobs(&Filter::new().eq("status", JobStatus::Running))?;
                sink.lock().unwrap().extend(running.into_iter().map(|j| j.updated_at));
                Ok(())
            }),
            Parameters::new(),
        )
        .unwrap()
        .unwrap();

    engine.tick().await.unwrap();
    let done = engine.jobs().get_single(job.job_id).unwrap().unwrap();
    let running = seen.lock().unwrap().clone();
    assert_eq!(running.len(), 1);
    assert!(job.updated_at < running[0]);
    assert!(running[0] < done.updated_at);
}

#[tokio::test]
async fn failing_handler_counts_one_retry_and_never_completes() {
    let engine = engine();
    let job = engine
        .perform_now(
            "broken",
            handler_fn(|_| anyhow::bail!("upstream returned 503")),
            Parameters::new(),
        )
        .unwrap()
        .unwrap();

    let report = engine.tick().await.unwrap();
    assert_eq!((report.completed, report.failed), (0, 1));

    let job = engine.jobs().get_single(job.job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retries, 1);
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_none());
    assert_eq!(job.error().as_deref(), Some("upstream returned 503"));
}

#[tokio::test]
async fn panicking_handler_is_recorded_as_failure() {
    let engine = engine();
    let job = engine
        .perform_now(
            "explodes",
            handler_fn(|_| -> anyhow::Result<()> { panic!("kaboom") }),
            Parameters::new(),
        )
        .unwrap()
        .unwrap();

    let report = engine.tick().await.unwrap();
    assert_eq!(report.failed, 1);
    let job = engine.jobs().get_single(job.job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error().unwrap().contains("kaboom"));
}

#[tokio::test]
async fn failed_job_is_retried_until_dead() {
    let engine = engine();
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&attempts);
    engine.register_handler(
        "flaky",
        handler_fn(move |p| {
            log.lock().unwrap().push(p.get("error").cloned());
            anyhow::bail!("nope")
        }),
    );
    let job = engine
        .enqueue(
            "flaky",
            Parameters::new(),
            EnqueueOptions::now().with_max_retries(2),
        )
        .unwrap();

    engine.tick().await.unwrap();
    let after_first = engine.jobs().get_single(job.job_id).unwrap().unwrap();
    assert_eq!(after_first.status, JobStatus::Failed);

    let report = engine.tick().await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.failed, 1);
    let dead = engine.jobs().get_single(job.job_id).unwrap().unwrap();
    assert_eq!(dead.status, JobStatus::Dead);
    assert_eq!(dead.retries, 2);

    let report = engine.tick().await.unwrap();
    assert_eq!((report.selected, report.requeued), (0, 0));

    // the retry sees the previous attempt's error in its parameters
    let attempts = attempts.lock().unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0], None);
    assert_eq!(attempts[1], Some(json!("nope")));
}

#[tokio::test]
async fn exhausted_jobs_are_never_selected() {
    let engine = engine();
    engine.register_handler("noop", handler_fn(|_| Ok(())));
    let zero = engine
        .enqueue("noop", Parameters::new(), EnqueueOptions::now().with_max_retries(0))
        .unwrap();
    let forced = engine.enqueue("noop", Parameters::new(), EnqueueOptions::now()).unwrap();
    engine
        .jobs()
        .update(
            JobUpdate {
                retries: Some(3),
                max_retries: Some(3),
                ..Default::default()
            },
            &Filter::new().eq("job_id", forced.job_id),
        )
        .unwrap();

    let report = engine.tick().await.unwrap();
    assert_eq!(report.selected, 0);
    for id in [zero.job_id, forced.job_id] {
        let job = engine.jobs().get_single(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }
}

#[tokio::test]
async fn parameters_reach_the_handler_unchanged() {
    let engine = engine();
    let payload = params(json!({
        "to": "ops@example.com",
        "attempt": 3,
        "tags": ["urgent", "billing"],
        "meta": {"nested": {"ok": true}, "ratio": 0.25},
        "nothing": null
    }));
    let received = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&received);
    engine
        .perform_now(
            "echo",
            handler_fn(move |p| {
                *slot.lock().unwrap() = Some(p);
                Ok(())
            }),
            payload.clone(),
        )
        .unwrap();

    engine.tick().await.unwrap();
    assert_eq!(received.lock().unwrap().as_ref(), Some(&payload));
}

#[tokio::test]
async fn future_jobs_wait_and_past_jobs_run() {
    let engine = engine();
    let hits = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&hits);
    let handler = handler_fn(move |p| {
        log.lock().unwrap().push(p["label"].as_str().unwrap_or_default().to_string());
        Ok(())
    });

    engine
        .perform_in(
            chrono::Duration::hours(1),
            "timed",
            Arc::clone(&handler),
            params(json!({"label": "later"})),
        )
        .unwrap();
    engine
        .perform_at(
            Utc::now() - chrono::Duration::days(2),
            "timed",
            Arc::clone(&handler),
            params(json!({"label": "overdue"})),
        )
        .unwrap();

    let report = engine.tick().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(*hits.lock().unwrap(), vec!["overdue".to_string()]);

    let pending = engine
        .jobs()
        .get_jobs(&Filter::new().eq("status", JobStatus::Pending))
        .unwrap();
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn due_jobs_run_in_schedule_order() {
    let engine = engine();
    let order = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&order);
    engine.register_handler(
        "ordered",
        handler_fn(move |p| {
            log.lock().unwrap().push(p["n"].as_i64().unwrap_or(-1));
            Ok(())
        }),
    );
    let now = Utc::now();
    for (n, mins_ago) in [(3, 1), (1, 30), (2, 10)] {
        engine
            .enqueue(
                "ordered",
                params(json!({ "n": n })),
                EnqueueOptions::at(now - chrono::Duration::minutes(mins_ago)),
            )
            .unwrap();
    }

    engine.tick().await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn async_handler_is_awaited_before_completion() {
    let engine = engine();
    let job = engine
        .perform_now(
            "slow",
            async_handler_fn(|_| async {
                tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                Ok(())
            }),
            Parameters::new(),
        )
        .unwrap()
        .unwrap();

    engine.tick().await.unwrap();
    let job = engine.jobs().get_single(job.job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn unregistered_handler_fails_later_jobs() {
    let engine = engine();
    engine.register_handler("temp", handler_fn(|_| Ok(())));
    assert!(engine.unregister_handler("temp"));
    let job = engine.enqueue("temp", Parameters::new(), EnqueueOptions::now()).unwrap();

    engine.tick().await.unwrap();
    let job = engine.jobs().get_single(job.job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);

    engine.clear_handlers();
    assert!(engine.registry().is_empty());
}

#[tokio::test]
async fn poll_loop_runs_until_shutdown() {
    let engine = engine_with(EngineSettings {
        poll_interval: std::time::Duration::from_millis(20),
        ..Default::default()
    });
    let job = engine
        .perform_now("bg", handler_fn(|_| Ok(())), Parameters::new())
        .unwrap()
        .unwrap();

    let handle = engine.start();
    let mut done = false;
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        if engine.jobs().get_single(job.job_id).unwrap().unwrap().status == JobStatus::Completed {
            done = true;
            break;
        }
    }
    assert!(done, "poll loop never completed the job");

    engine.shutdown(handle).await.unwrap();
    assert!(engine.gateway().is_closed());
    let err = engine.jobs().get_single(job.job_id).unwrap_err();
    assert!(matches!(err, SchedulerError::StorageClosed));
}

#[tokio::test]
async fn poll_handle_stop_leaves_storage_open() {
    let engine = engine_with(EngineSettings {
        poll_interval: std::time::Duration::from_millis(20),
        ..Default::default()
    });
    let handle = engine.start();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    handle.stop().await;

    assert!(!engine.gateway().is_closed());
    assert!(engine.jobs().get_jobs(&Filter::new()).unwrap().is_empty());
}
