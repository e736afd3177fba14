use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gutpunch_scheduler::{
    async_handler_fn, handler_fn, EngineSettings, EnqueueOptions, Filter, Gateway, JobStatus,
    NewQueue, Parameters, SchedulerEngine, SchedulerError,
};
use tokio::sync::Notify;

fn engine_with(settings: EngineSettings) -> Arc<SchedulerEngine> {
    let gateway = Arc::new(Gateway::open_in_memory().unwrap());
    Arc::new(SchedulerEngine::new(gateway, settings))
}

#[tokio::test]
async fn worker_limit_bounds_concurrency() {
    let engine = engine_with(EngineSettings {
        max_workers: 2,
        ..Default::default()
    });
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
    engine.register_handler(
        "busy",
        async_handler_fn(move |_| {
            let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(40)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    );
    for _ in 0..5 {
        engine.enqueue("busy", Parameters::new(), EnqueueOptions::now()).unwrap();
    }

    let report = engine.tick().await.unwrap();
    assert_eq!(report.completed, 5);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(active.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn single_worker_runs_jobs_one_at_a_time() {
    let engine = engine_with(EngineSettings::default());
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
    engine.register_handler(
        "serial",
        async_handler_fn(move |_| {
            let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    );
    for _ in 0..3 {
        engine.enqueue("serial", Parameters::new(), EnqueueOptions::now()).unwrap();
    }

    engine.tick().await.unwrap();
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn timed_out_handler_marks_job_failed() {
    let engine = engine_with(EngineSettings {
        job_timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    });
    let job = engine
        .perform_now(
            "hangs",
            async_handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }),
            Parameters::new(),
        )
        .unwrap()
        .unwrap();

    let report = engine.tick().await.unwrap();
    assert_eq!(report.failed, 1);
    let job = engine.jobs().get_single(job.job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retries, 1);
    assert!(job.error().unwrap().contains("timed out"));
}

#[tokio::test]
async fn overlapping_tick_is_skipped() {
    let engine = engine_with(EngineSettings::default());
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (s, r) = (Arc::clone(&started), Arc::clone(&release));
    engine
        .perform_now(
            "gate",
            async_handler_fn(move |_| {
                let (started, release) = (Arc::clone(&s), Arc::clone(&r));
                async move {
                    started.notify_one();
                    release.notified().await;
                    Ok(())
                }
            }),
            Parameters::new(),
        )
        .unwrap();

    let first = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.tick().await })
    };
    started.notified().await;

    let second = engine.tick().await.unwrap();
    assert!(second.skipped);
    assert_eq!(second.selected, 0);

    release.notify_one();
    let first = first.await.unwrap().unwrap();
    assert!(!first.skipped);
    assert_eq!(first.completed, 1);
}

#[tokio::test]
async fn drain_runs_queue_jobs_regardless_of_schedule() {
    let engine = engine_with(EngineSettings::default());
    let runs = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&runs);
    engine.register_handler(
        "mail",
        handler_fn(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );
    let outbox = engine.queues().create(NewQueue::new("outbox").with_priority(1)).unwrap();
    let queued = engine
        .enqueue(
            "mail",
            Parameters::new(),
            EnqueueOptions::after(chrono::Duration::days(1)).in_queue(outbox.queue_id),
        )
        .unwrap();
    let loose = engine
        .enqueue("mail", Parameters::new(), EnqueueOptions::after(chrono::Duration::days(1)))
        .unwrap();

    let report = engine.process_queue_jobs("outbox").await.unwrap();
    assert_eq!((report.selected, report.completed), (1, 1));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let queued = engine.jobs().get_single(queued.job_id).unwrap().unwrap();
    assert_eq!(queued.status, JobStatus::Completed);
    let loose = engine.jobs().get_single(loose.job_id).unwrap().unwrap();
    assert_eq!(loose.status, JobStatus::Pending);

    let again = engine.process_queue_jobs("outbox").await.unwrap();
    assert_eq!(again.selected, 0);
}

#[tokio::test]
async fn drain_failure_uses_the_same_failure_write() {
    let engine = engine_with(EngineSettings::default());
    let q = engine.queues().create(NewQueue::new("risky")).unwrap();
    let job = engine
        .enqueue(
            "missing",
            Parameters::new(),
            EnqueueOptions::now().in_queue(q.queue_id).with_max_retries(1),
        )
        .unwrap();

    let report = engine.dispatcher().process_queue_jobs("risky").await.unwrap();
    assert_eq!(report.failed, 1);
    let job = engine.jobs().get_single(job.job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Dead);
    assert_eq!(job.retries, 1);
    assert!(job.error().unwrap().contains("missing"));
}

#[tokio::test]
async fn drain_unknown_queue_errors() {
    let engine = engine_with(EngineSettings::default());
    let err = engine.process_queue_jobs("ghost").await.unwrap_err();
    assert!(matches!(err, SchedulerError::QueueNotFound { name } if name == "ghost"));
}

#[tokio::test]
async fn deleting_a_queue_keeps_its_jobs() {
    let engine = engine_with(EngineSettings::default());
    let q1 = engine.queues().create(NewQueue::new("q1").with_priority(1)).unwrap();
    engine.queues().create(NewQueue::new("q2").with_priority(9999)).unwrap();

    let names: Vec<String> = engine
        .queues()
        .get_queues(&Filter::new())
        .unwrap()
        .into_iter()
        .map(|q| q.name)
        .collect();
    assert_eq!(names, vec!["q1", "q2"]);

    let job = engine
        .enqueue("x", Parameters::new(), EnqueueOptions::now().in_queue(q1.queue_id))
        .unwrap();
    engine.queues().delete(q1.queue_id).unwrap();

    assert!(engine.queues().get_single(q1.queue_id).unwrap().is_none());
    let orphans = engine
        .jobs()
        .get_jobs(&Filter::new().eq("queue_id", q1.queue_id))
        .unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].job_id, job.job_id);
}

#[tokio::test]
async fn tick_and_drain_race_runs_handler_once() {
    let engine = engine_with(EngineSettings::default());
    let runs = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&runs);
    engine.register_handler(
        "contended",
        async_handler_fn(move |_| {
            let runs = Arc::clone(&r);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Ok(())
            }
        }),
    );
    let q = engine.queues().create(NewQueue::new("q")).unwrap();
    let job = engine
        .enqueue("contended", Parameters::new(), EnqueueOptions::now().in_queue(q.queue_id))
        .unwrap();

    let (tick, drain) = tokio::join!(engine.tick(), engine.process_queue_jobs("q"));
    let (tick, drain) = (tick.unwrap(), drain.unwrap());
    assert_eq!(tick.completed + drain.completed, 1);
    assert_eq!(tick.failed + drain.failed, 0);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let job = engine.jobs().get_single(job.job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retries, 0);
}

#[tokio::test]
async fn tick_and_drain_race_charges_missing_handler_once() {
    let engine = engine_with(EngineSettings::default());
    let q = engine.queues().create(NewQueue::new("q")).unwrap();
    let job = engine
        .enqueue("unregistered", Parameters::new(), EnqueueOptions::now().in_queue(q.queue_id))
        .unwrap();

    let (tick, drain) = tokio::join!(engine.tick(), engine.process_queue_jobs("q"));
    let (tick, drain) = (tick.unwrap(), drain.unwrap());
    assert_eq!(tick.selected + drain.selected, 2, "both paths saw the row");
    assert_eq!(tick.failed + drain.failed, 1);

    let job = engine.jobs().get_single(job.job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retries, 1);
}
