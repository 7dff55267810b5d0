//! Durable job storage on SQLite.
//!
//! Every operation runs as a single transaction. The pool holds exactly one
//! connection, so transactions are serialised: a reservation's select and
//! update can never interleave with another reservation on the same queue.
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use thiserror::Error;
use tracing::debug;

use crate::types::job::{Job, PutAction, QueueStats, DEFAULT_TTR};
use crate::types::protocol::{Message, MAX_MESSAGE_SIZE};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The job can't be stored as given.
    #[error("invalid {0}")]
    Invalid(&'static str),
    /// A `job` reply carrying the job wouldn't fit in a datagram.
    #[error("job too large")]
    TooLarge,
    /// A stored row doesn't describe a valid job.
    #[error("corrupt row: {0}")]
    Corrupt(&'static str),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS "jobs" (
    "id"         TEXT PRIMARY KEY,
    "queue"      TEXT NOT NULL,
    "priority"   REAL NOT NULL,
    "hold_until" INTEGER NOT NULL,
    "ttr"        INTEGER NOT NULL,
    "content"    TEXT NOT NULL
)
"#;

const CREATE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS "jobs_queue_priority"
    ON "jobs" ("queue", "priority" DESC)
"#;

const SELECT_TOP: &str = r#"
SELECT "id", "queue", "priority", "hold_until", "ttr", "content"
FROM "jobs"
WHERE "queue" = ? AND "hold_until" < ?
ORDER BY "priority" DESC
LIMIT 1
"#;

/// Handle to the job table. Cheap to clone.
#[derive(Clone, Debug)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Opens the database at `url` (e.g. `sqlite://jobs.db` or
    /// `sqlite::memory:`), creating it and the job table if needed.
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        Self::connect(SqliteConnectOptions::from_str(url)?).await
    }

    /// Opens the database file at `path`, creating it and the job table if
    /// needed.
    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::connect(SqliteConnectOptions::new().filename(path)).await
    }

    async fn connect(
        options: SqliteConnectOptions,
    ) -> Result<Self, StoreError> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // One long-lived connection: it's the single writer, and it keeps
        // in-memory databases alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        sqlx::query(CREATE_INDEX).execute(&pool).await?;
        debug!("job table ready");

        Ok(Self { pool })
    }

    /// Closes the underlying connection. Later operations fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Inserts the job, or merges it into the stored job with the same ID.
    ///
    /// A zero `hold_until` means `now` and a zero `ttr` means
    /// [`DEFAULT_TTR`]. A merge overwrites priority, TTR and content, but only
    /// ever moves `hold_until` earlier. The stored job keeps its queue.
    ///
    /// Jobs too large to ever be handed back in a `job` reply are refused.
    pub async fn put(
        &self,
        mut job: Job,
        now: i64,
    ) -> Result<PutAction, StoreError> {
        if job.priority.is_nan() {
            return Err(StoreError::Invalid("priority"));
        }
        if job.hold_until == 0 {
            job.hold_until = now;
        }
        if job.ttr == 0 {
            job.ttr = DEFAULT_TTR;
        }
        let ttr =
            i64::try_from(job.ttr).map_err(|_| StoreError::Invalid("ttr"))?;

        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64, String)> = sqlx::query_as(
            r#"SELECT "hold_until", "queue" FROM "jobs" WHERE "id" = ?"#,
        )
        .bind(&job.id)
        .fetch_optional(&mut *tx)
        .await?;

        let action = match existing {
            None => {
                check_deliverable(&job)?;

                sqlx::query(
                    r#"
INSERT INTO "jobs" ("id", "queue", "priority", "hold_until", "ttr", "content")
VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&job.id)
                .bind(&job.queue)
                .bind(job.priority)
                .bind(job.hold_until)
                .bind(ttr)
                .bind(&job.content)
                .execute(&mut *tx)
                .await?;

                PutAction::Created
            },
            Some((hold_until, queue)) => {
                check_deliverable(&Job {
                    queue,
                    ..job.clone()
                })?;

                sqlx::query(
                    r#"
UPDATE "jobs"
SET "priority" = ?, "hold_until" = ?, "ttr" = ?, "content" = ?
WHERE "id" = ?
                    "#,
                )
                .bind(job.priority)
                .bind(job.hold_until.min(hold_until))
                .bind(ttr)
                .bind(&job.content)
                .bind(&job.id)
                .execute(&mut *tx)
                .await?;

                PutAction::Updated
            },
        };

        tx.commit().await?;

        debug!(id = %job.id, queue = %job.queue, %action, "put job");
        Ok(action)
    }

    /// Reserves the highest-priority job on `queue` whose `hold_until` is
    /// before `now`, holding it until `now + ttr`.
    ///
    /// Returns the job as it was before the hold was extended, or None if no
    /// job is eligible.
    pub async fn reserve_top(
        &self,
        queue: &str,
        now: i64,
    ) -> Result<Option<Job>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let Some(job) = select_top(&mut tx, queue, now).await? else {
            tx.commit().await?;
            return Ok(None);
        };

        let ttr =
            i64::try_from(job.ttr).map_err(|_| StoreError::Corrupt("ttr"))?;
        let held_until = now.saturating_add(ttr);

        sqlx::query(r#"UPDATE "jobs" SET "hold_until" = ? WHERE "id" = ?"#)
            .bind(held_until)
            .bind(&job.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(id = %job.id, queue, held_until, "reserved job");
        Ok(Some(job))
    }

    /// Returns the job [`reserve_top`](Self::reserve_top) would reserve,
    /// without reserving it.
    pub async fn peek_top(
        &self,
        queue: &str,
        now: i64,
    ) -> Result<Option<Job>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let job = select_top(&mut tx, queue, now).await?;
        tx.commit().await?;

        Ok(job)
    }

    /// Deletes the job with this ID if it belongs to `queue`, returning
    /// whether there was such a job.
    pub async fn delete(
        &self,
        queue: &str,
        id: &str,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let result =
            sqlx::query(r#"DELETE FROM "jobs" WHERE "queue" = ? AND "id" = ?"#)
                .bind(queue)
                .bind(id)
                .execute(&mut *tx)
                .await?;

        tx.commit().await?;

        let existed = result.rows_affected() > 0;
        debug!(id, queue, existed, "deleted job");
        Ok(existed)
    }

    /// Counts the jobs on `queue`, and those of them eligible at `now`.
    pub async fn queue_stats(
        &self,
        queue: &str,
        now: i64,
    ) -> Result<QueueStats, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
SELECT COUNT(*) AS "total", COALESCE(SUM("hold_until" < ?), 0) AS "ready"
FROM "jobs"
WHERE "queue" = ?
            "#,
        )
        .bind(now)
        .bind(queue)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let total: i64 = row.try_get("total")?;
        let ready: i64 = row.try_get("ready")?;

        Ok(QueueStats {
            queue: queue.to_owned(),
            total: unsigned(total, "total")?,
            ready: unsigned(ready, "ready")?,
        })
    }
}

async fn select_top(
    conn: &mut SqliteConnection,
    queue: &str,
    now: i64,
) -> Result<Option<Job>, StoreError> {
    sqlx::query(SELECT_TOP)
        .bind(queue)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| job_from_row(&row))
        .transpose()
}

/// Fails unless every `job` reply for this job fits in a datagram.
fn check_deliverable(job: &Job) -> Result<(), StoreError> {
    if Message::max_job_reply_size(job) > MAX_MESSAGE_SIZE {
        return Err(StoreError::TooLarge);
    }
    Ok(())
}

fn unsigned(value: i64, name: &'static str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(name))
}

fn job_from_row(row: &SqliteRow) -> Result<Job, StoreError> {
    let ttr: i64 = row.try_get("ttr")?;

    Ok(Job {
        id: row.try_get("id")?,
        queue: row.try_get("queue")?,
        priority: row.try_get("priority")?,
        hold_until: row.try_get("hold_until")?,
        ttr: unsigned(ttr, "ttr")?,
        content: row.try_get("content")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    async fn store() -> JobStore {
        JobStore::open("sqlite::memory:").await.unwrap()
    }

    fn job(queue: &str, id: &str, priority: f64, hold_until: i64) -> Job {
        Job {
            id: id.into(),
            queue: queue.into(),
            priority,
            hold_until,
            ttr: 10,
            content: format!("content of {id}"),
        }
    }

    async fn stored(store: &JobStore, queue: &str) -> Job {
        store
            .peek_top(queue, i64::MAX)
            .await
            .unwrap()
            .expect("job should be stored")
    }

    #[tokio::test]
    async fn test_put_defaults() {
        let store = store().await;

        let mut new = job("q", "a", 1.0, 0);
        new.ttr = 0;
        assert_eq!(store.put(new, NOW).await.unwrap(), PutAction::Created);

        let got = stored(&store, "q").await;
        assert_eq!(got.hold_until, NOW);
        assert_eq!(got.ttr, DEFAULT_TTR);
    }

    #[tokio::test]
    async fn test_put_merge_only_pulls_hold_earlier() {
        let store = store().await;

        store.put(job("q", "a", 1.0, NOW + 100), NOW).await.unwrap();

        // Later hold: ignored, but other fields are updated.
        let mut later = job("q", "a", 7.0, NOW + 500);
        later.content = "new content".into();
        later.ttr = 99;
        assert_eq!(store.put(later, NOW).await.unwrap(), PutAction::Updated);

        let got = stored(&store, "q").await;
        assert_eq!(got.hold_until, NOW + 100);
        assert_eq!(got.priority, 7.0);
        assert_eq!(got.ttr, 99);
        assert_eq!(got.content, "new content");

        // Earlier hold: applied.
        store.put(job("q", "a", 7.0, NOW + 20), NOW).await.unwrap();
        assert_eq!(stored(&store, "q").await.hold_until, NOW + 20);
    }

    #[tokio::test]
    async fn test_put_keeps_original_queue() {
        let store = store().await;

        store.put(job("a", "x", 1.0, NOW - 1), NOW).await.unwrap();
        assert_eq!(
            store.put(job("b", "x", 2.0, NOW - 1), NOW).await.unwrap(),
            PutAction::Updated
        );

        assert_eq!(store.peek_top("b", NOW).await.unwrap(), None);
        let kept = store.peek_top("a", NOW).await.unwrap().unwrap();
        assert_eq!(kept.priority, 2.0);
    }

    #[tokio::test]
    async fn test_put_rejects_invalid_values() {
        let store = store().await;

        assert!(matches!(
            store.put(job("q", "a", f64::NAN, NOW), NOW).await,
            Err(StoreError::Invalid("priority"))
        ));

        let mut huge_ttr = job("q", "a", 1.0, NOW);
        huge_ttr.ttr = u64::MAX;
        assert!(matches!(
            store.put(huge_ttr, NOW).await,
            Err(StoreError::Invalid("ttr"))
        ));
    }

    /// A job whose largest possible reply is exactly `size` bytes.
    fn job_with_reply_size(size: usize) -> Job {
        let mut job = job("q", "big", 1.0, NOW - 1);
        job.content = "x".into();
        let overhead = Message::max_job_reply_size(&job) - 1;
        job.content = "x".repeat(size - overhead);
        job
    }

    #[tokio::test]
    async fn test_put_rejects_undeliverable_jobs() {
        let store = store().await;

        let fits = job_with_reply_size(MAX_MESSAGE_SIZE);
        assert_eq!(Message::max_job_reply_size(&fits), MAX_MESSAGE_SIZE);
        assert_eq!(store.put(fits, NOW).await.unwrap(), PutAction::Created);

        let too_big = job_with_reply_size(MAX_MESSAGE_SIZE + 1);
        assert!(matches!(
            store.put(too_big, NOW).await,
            Err(StoreError::TooLarge)
        ));

        // Defaults count: a zero TTR is stored as a wider one.
        let mut defaulted = job_with_reply_size(MAX_MESSAGE_SIZE);
        defaulted.id = "defaulted".into();
        defaulted.ttr = 0;
        assert!(matches!(
            store.put(defaulted, NOW).await,
            Err(StoreError::TooLarge)
        ));
    }

    #[tokio::test]
    async fn test_put_merge_checks_size_against_stored_queue() {
        let store = store().await;

        let mut long_queue = job("q", "a", 1.0, NOW - 1);
        long_queue.queue = "q".repeat(100);
        store.put(long_queue, NOW).await.unwrap();

        // Fits under queue "q", but the job stays on the longer queue.
        let mut update = job_with_reply_size(MAX_MESSAGE_SIZE);
        update.id = "a".into();
        assert!(matches!(
            store.put(update, NOW).await,
            Err(StoreError::TooLarge)
        ));
    }

    #[tokio::test]
    async fn test_reserve_priority_order() {
        let store = store().await;

        for (id, priority) in [("low", 1.0), ("high", 5.0), ("mid", 3.0)] {
            store.put(job("q", id, priority, NOW - 1), NOW).await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(job) = store.reserve_top("q", NOW).await.unwrap() {
            order.push(job.priority);
        }

        assert_eq!(order, [5.0, 3.0, 1.0]);
    }

    #[tokio::test]
    async fn test_reserve_only_eligible_jobs_in_queue() {
        let store = store().await;

        store.put(job("q", "due-now", 1.0, NOW), NOW).await.unwrap();
        store.put(job("q", "later", 9.0, NOW + 60), NOW).await.unwrap();
        store.put(job("other", "elsewhere", 9.0, NOW - 60), NOW).await.unwrap();

        // hold_until must be strictly in the past.
        assert_eq!(store.reserve_top("q", NOW).await.unwrap(), None);

        let got = store.reserve_top("q", NOW + 1).await.unwrap().unwrap();
        assert_eq!(got.id, "due-now");
    }

    #[tokio::test]
    async fn test_default_hold_is_reservable_from_next_second() {
        let store = store().await;

        // A zero hold_until is stored as `now`, which isn't yet in the past.
        store.put(job("q", "a", 1.0, 0), NOW).await.unwrap();

        assert_eq!(store.peek_top("q", NOW).await.unwrap(), None);
        assert_eq!(store.reserve_top("q", NOW).await.unwrap(), None);

        let got = store.reserve_top("q", NOW + 1).await.unwrap().unwrap();
        assert_eq!(got.hold_until, NOW);
    }

    #[tokio::test]
    async fn test_reserve_returns_snapshot_and_extends_hold() {
        let store = store().await;

        store.put(job("q", "a", 1.0, NOW - 5), NOW).await.unwrap();

        let got = store.reserve_top("q", NOW).await.unwrap().unwrap();
        assert_eq!(got, job("q", "a", 1.0, NOW - 5));

        assert_eq!(stored(&store, "q").await.hold_until, NOW + 10);
    }

    #[tokio::test]
    async fn test_ttr_redelivery() {
        let store = store().await;

        let mut short = job("q", "a", 1.0, NOW - 1);
        short.ttr = 1;
        store.put(short, NOW).await.unwrap();

        assert!(store.reserve_top("q", NOW).await.unwrap().is_some());
        // Held until NOW + 1.
        assert_eq!(store.reserve_top("q", NOW).await.unwrap(), None);
        assert_eq!(store.reserve_top("q", NOW + 1).await.unwrap(), None);

        let again = store.reserve_top("q", NOW + 2).await.unwrap().unwrap();
        assert_eq!(again.id, "a");
        assert_eq!(again.hold_until, NOW + 1);
    }

    #[tokio::test]
    async fn test_concurrent_reservations_are_exclusive() {
        let store = store().await;

        store.put(job("q", "only", 1.0, NOW - 1), NOW).await.unwrap();

        let (a, b) = tokio::join!(
            store.reserve_top("q", NOW),
            store.reserve_top("q", NOW)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(a.is_some() != b.is_some(), "got {a:?} and {b:?}");
    }

    #[tokio::test]
    async fn test_concurrent_reservations_across_tasks() {
        let store = store().await;

        for n in 0..10 {
            store
                .put(job("q", &format!("job-{n}"), n as f64, NOW - 1), NOW)
                .await
                .unwrap();
        }

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.reserve_top("q", NOW).await })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            if let Some(job) = task.await.unwrap().unwrap() {
                ids.push(job.id);
            }
        }

        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10);
    }

    #[tokio::test]
    async fn test_peek_does_not_reserve() {
        let store = store().await;

        store.put(job("q", "a", 1.0, NOW - 1), NOW).await.unwrap();

        let peeked = store.peek_top("q", NOW).await.unwrap().unwrap();
        assert_eq!(peeked, store.peek_top("q", NOW).await.unwrap().unwrap());
        assert_eq!(store.reserve_top("q", NOW).await.unwrap(), Some(peeked));
        assert_eq!(store.peek_top("q", NOW).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_is_scoped_to_queue() {
        let store = store().await;

        store.put(job("b", "x", 1.0, NOW - 1), NOW).await.unwrap();

        assert!(!store.delete("a", "x").await.unwrap());
        assert!(store.delete("b", "x").await.unwrap());
        assert!(!store.delete("b", "x").await.unwrap());
        assert_eq!(store.peek_top("b", NOW).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_queue_stats() {
        let store = store().await;

        assert_eq!(
            store.queue_stats("q", NOW).await.unwrap(),
            QueueStats {
                queue: "q".into(),
                total: 0,
                ready: 0,
            }
        );

        store.put(job("q", "a", 1.0, NOW - 1), NOW).await.unwrap();
        store.put(job("q", "b", 1.0, NOW + 60), NOW).await.unwrap();
        store.put(job("other", "c", 1.0, NOW - 1), NOW).await.unwrap();

        assert_eq!(
            store.queue_stats("q", NOW).await.unwrap(),
            QueueStats {
                queue: "q".into(),
                total: 2,
                ready: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_closed_store_fails() {
        let store = store().await;
        store.close().await;

        assert!(matches!(
            store.reserve_top("q", NOW).await,
            Err(StoreError::Database(_))
        ));
    }
}
