use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `queues` and `jobs` tables (idempotent) plus the indexes the
/// due-job and queue-drain selections use. `jobs.queue_id` has
/// no foreign key: deleting a queue leaves its jobs in place.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS queues (
            queue_id     INTEGER PRIMARY KEY AUTOINCREMENT,
            name         TEXT    NOT NULL UNIQUE,
            description  TEXT,
            priority     INTEGER NOT NULL DEFAULT 0,
            enqueued     INTEGER NOT NULL DEFAULT 0,
            enqueued_at  TEXT,               -- RFC 3339 or NULL
            created_at   TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS jobs (
            job_id          INTEGER PRIMARY KEY AUTOINCREMENT,
            queue_id        INTEGER,            -- NULL means unqueued
            job_name        TEXT    NOT NULL,
            parameters      TEXT    NOT NULL DEFAULT '{}',  -- JSON object
            status          INTEGER NOT NULL DEFAULT 0,
            scheduled_time  TEXT    NOT NULL,   -- 'YYYY-MM-DD HH:MM:SS' UTC
            retries         INTEGER NOT NULL DEFAULT 0,
            max_retries     INTEGER NOT NULL DEFAULT 3,
            started_at      TEXT,
            completed_at    TEXT,
            created_at      TEXT    NOT NULL,
            updated_at      TEXT    NOT NULL
        ) STRICT;

        -- Due-job poll: WHERE status = 0 AND scheduled_time <= ? ORDER BY scheduled_time
        CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs (status, scheduled_time);
        CREATE INDEX IF NOT EXISTS idx_jobs_queue ON jobs (queue_id, status);
        ",
    )?;
    Ok(())
}
