//! One function per CLI subcommand. Each returns a serialisable value that
//! `main` prints as JSON.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use gutpunch_scheduler::{
    Delay, EnqueueOptions, Filter, Job, JobStatus, NewQueue, Parameters, Queue, QueueUpdate,
    SchedulerEngine,
};
use tracing::info;

/// Decode `--params`. Absent means an empty object; anything but an object
/// is rejected.
pub fn parse_params(raw: Option<&str>) -> anyhow::Result<Parameters> {
    let Some(raw) = raw else {
        return Ok(Parameters::new());
    };
    match serde_json::from_str::<serde_json::Value>(raw).context("--params is not valid JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("--params must be a JSON object, got {other}"),
    }
}

pub struct EnqueueArgs<'a> {
    pub name: &'a str,
    pub params: Option<&'a str>,
    pub in_secs: Option<i64>,
    pub at: Option<&'a str>,
    pub queue: Option<&'a str>,
    pub max_retries: Option<u32>,
}

pub fn enqueue(engine: &SchedulerEngine, args: EnqueueArgs<'_>) -> anyhow::Result<Job> {
    let parameters = parse_params(args.params)?;
    let mut options = match (args.in_secs, args.at) {
        (Some(secs), _) => EnqueueOptions::after(Delay::Seconds(secs)),
        (None, Some(at)) => {
            let at = DateTime::parse_from_rfc3339(at)
                .with_context(|| format!("--at {at:?} is not RFC 3339"))?;
            EnqueueOptions::at(at.with_timezone(&Utc))
        }
        (None, None) => EnqueueOptions::now(),
    };
    if let Some(queue) = args.queue {
        options = options.in_queue(queue_by_name(engine, queue)?.queue_id);
    }
    if let Some(max) = args.max_retries {
        options = options.with_max_retries(max);
    }
    Ok(engine.enqueue(args.name, parameters, options)?)
}

pub fn list_jobs(
    engine: &SchedulerEngine,
    status: Option<&str>,
    queue: Option<&str>,
) -> anyhow::Result<Vec<Job>> {
    let mut filter = Filter::new();
    if let Some(status) = status {
        let status: JobStatus = status.parse().map_err(|e: String| anyhow!(e))?;
        filter = filter.eq("status", status);
    }
    if let Some(queue) = queue {
        filter = filter.eq("queue_id", queue_by_name(engine, queue)?.queue_id);
    }
    Ok(engine.jobs().get_jobs(&filter)?)
}

pub fn list_queues(engine: &SchedulerEngine) -> anyhow::Result<Vec<Queue>> {
    Ok(engine.queues().get_queues(&Filter::new())?)
}

pub fn create_queue(
    engine: &SchedulerEngine,
    name: &str,
    priority: i64,
    description: Option<&str>,
) -> anyhow::Result<Queue> {
    let mut queue = NewQueue::new(name).with_priority(priority);
    if let Some(description) = description {
        queue = queue.with_description(description);
    }
    Ok(engine.queues().create(queue)?)
}

pub fn update_queue(
    engine: &SchedulerEngine,
    name: &str,
    rename: Option<&str>,
    priority: Option<i64>,
    description: Option<&str>,
) -> anyhow::Result<Queue> {
    let queue = queue_by_name(engine, name)?;
    let update = QueueUpdate {
        name: rename.map(String::from),
        description: description.map(|d| Some(d.to_string())),
        priority,
    };
    engine
        .queues()
        .update(update, &Filter::new().eq("queue_id", queue.queue_id))?;
    engine
        .queues()
        .get_single(queue.queue_id)?
        .ok_or_else(|| anyhow!("queue {name} vanished during update"))
}

pub fn delete_queue(engine: &SchedulerEngine, name: &str) -> anyhow::Result<Queue> {
    let queue = queue_by_name(engine, name)?;
    engine.queues().delete(queue.queue_id)?;
    info!(queue = name, "queue deleted; its jobs are kept");
    Ok(queue)
}

/// Counts for every status, zero included.
pub fn stats(engine: &SchedulerEngine) -> anyhow::Result<BTreeMap<String, usize>> {
    let counts = engine.jobs().count_by_status()?;
    Ok(JobStatus::ALL
        .iter()
        .map(|s| (s.to_string(), counts.get(s).copied().unwrap_or(0)))
        .collect())
}

fn queue_by_name(engine: &SchedulerEngine, name: &str) -> anyhow::Result<Queue> {
    engine
        .queues()
        .find_by_name(name)?
        .ok_or_else(|| anyhow!("queue not found: {name}"))
}
