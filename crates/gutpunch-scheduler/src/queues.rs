use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::Row;
use tracing::{info, instrument};

use crate::{
    error::{Result, SchedulerError},
    storage::{Filter, Gateway, Table},
    types::{NewQueue, Queue, QueueId, QueueUpdate},
};

/// Typed access to the `queues` table.
///
/// Reads are always ordered by ascending priority, ties broken by id.
/// Deleting a queue removes only the queue row; jobs that reference it keep
/// their `queue_id` so their history stays queryable.
#[derive(Clone)]
pub struct QueueRepository {
    gateway: Arc<Gateway>,
}

impl QueueRepository {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub fn get_queues(&self, filter: &Filter) -> Result<Vec<Queue>> {
        self.gateway
            .select(Table::Queues, filter, &["priority", "queue_id"], row_to_queue)
    }

    pub fn get_single(&self, id: QueueId) -> Result<Option<Queue>> {
        self.gateway
            .select_one(Table::Queues, &Filter::new().eq("queue_id", id), row_to_queue)
    }

    pub fn find_by_name(&self, name: &str) -> Result<Option<Queue>> {
        self.gateway.select_one(
            Table::Queues,
            &Filter::new().eq("name", name.to_string()),
            row_to_queue,
        )
    }

    #[instrument(skip(self, queue), fields(name = %queue.name))]
    pub fn create(&self, queue: NewQueue) -> Result<Queue> {
        if self.find_by_name(&queue.name)?.is_some() {
            return Err(SchedulerError::QueueExists { name: queue.name });
        }
        let id = self.gateway.insert(
            Table::Queues,
            &[
                ("name", Value::Text(queue.name.clone())),
                ("description", queue.description.map_or(Value::Null, Value::Text)),
                ("priority", Value::Integer(queue.priority)),
                ("enqueued", Value::Integer(0)),
                ("created_at", Value::Text(self.gateway.clock().timestamp())),
            ],
        )?;
        info!(queue_id = id, priority = queue.priority, "queue created");
        self.get_single(QueueId(id))?
            .ok_or(SchedulerError::QueueNotFound { name: queue.name })
    }

    /// Partial update of every row matching `filter`.
    pub fn update(&self, data: QueueUpdate, filter: &Filter) -> Result<usize> {
        let mut set: Vec<(&str, Value)> = Vec::new();
        if let Some(name) = data.name {
            set.push(("name", Value::Text(name)));
        }
        if let Some(description) = data.description {
            set.push(("description", description.map_or(Value::Null, Value::Text)));
        }
        if let Some(priority) = data.priority {
            set.push(("priority", Value::Integer(priority)));
        }
        self.gateway.update(Table::Queues, &set, filter)
    }

    /// Hard delete of the queue row only. Returns the number of rows removed.
    pub fn delete(&self, id: QueueId) -> Result<usize> {
        let n = self
            .gateway
            .delete(Table::Queues, &Filter::new().eq("queue_id", id))?;
        if n > 0 {
            info!(queue_id = %id, "queue deleted");
        }
        Ok(n)
    }

    /// Adjust the `enqueued` counter by `delta` (floored at zero). A positive
    /// delta also stamps `enqueued_at`.
    pub fn adjust_enqueued(&self, id: QueueId, delta: i64) -> Result<usize> {
        if delta > 0 {
            self.gateway.execute_raw(
                "UPDATE queues SET enqueued = enqueued + ?1, enqueued_at = ?2 WHERE queue_id = ?3",
                &[
                    Value::Integer(delta),
                    Value::Text(self.gateway.clock().timestamp()),
                    id.into(),
                ],
            )
        } else {
            self.gateway.execute_raw(
                "UPDATE queues SET enqueued = MAX(enqueued + ?1, 0) WHERE queue_id = ?2",
                &[Value::Integer(delta), id.into()],
            )
        }
    }
}

fn row_to_queue(row: &Row<'_>) -> rusqlite::Result<Queue> {
    Ok(Queue {
        queue_id: row.get("queue_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        priority: row.get("priority")?,
        enqueued: row.get("enqueued")?,
        enqueued_at: row.get("enqueued_at")?,
        created_at: row.get("created_at")?,
    })
}
