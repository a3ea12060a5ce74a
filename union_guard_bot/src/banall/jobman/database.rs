use std::str::FromStr;

use chrono::{Duration, Utc};
use sqlx::sqlite::SqliteRow;
pub use sqlx::Error;
use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Executor, Row, Sqlite,
};
use teloxide::types::{ChatId, MessageId, UserId};
use tokio::sync::Mutex;

use crate::banall::{
    ActionKind, BanAllRecord, ExecutionProgress, ListTargetsError, StatusHandle, TargetLister,
};
use crate::voting::VoteOutcome;

type Pool = sqlx::Pool<Sqlite>;
const DB_PATH: &str = "sqlite:union_guard.sqlite";

/// Successful and skipped children stick around this long for operator
/// inspection; failures stay noticeably longer.
const SUCCESS_RETENTION_HOURS: i64 = 1;
const FAILURE_RETENTION_HOURS: i64 = 24;
/// Hard cap per bucket, in case a fan-out dwarfs the time-based rules.
const RETENTION_MAX_ROWS: u32 = 1000;

/// Terminal state of a child job, as stored in its status column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildOutcome {
    Succeeded = 2,
    Failed = 3,
    Ignored = 4,
}

/// One queued per-chat action, as handed to an execution worker.
#[allow(dead_code)] // Intentionally allow unused fields here.
#[derive(Debug, Clone)]
pub struct ChildJobInfo {
    pub child_id: i64,
    pub parent_id: i64,
    pub chat_id: ChatId,
    pub target: UserId,
    pub action: ActionKind,
}

/// One fan-out's parent row.
#[derive(Debug, Clone)]
pub struct ParentJobInfo {
    pub parent_id: i64,
    pub record_id: i64,
    pub progress: ExecutionProgress,
    pub completed: bool,
}

impl ParentJobInfo {
    fn from_sqlite_row(row: SqliteRow) -> ParentJobInfo {
        ParentJobInfo {
            parent_id: row.get(0),
            record_id: row.get(1),
            progress: ExecutionProgress {
                total_targets: row.get::<i64, _>(2) as u32,
                processed: row.get::<i64, _>(3) as u32,
                failed: row.get::<i64, _>(4) as u32,
                ignored: row.get::<i64, _>(5) as u32,
            },
            completed: row.get(6),
        }
    }
}

fn vote_outcome_to_db(outcome: VoteOutcome) -> i64 {
    match outcome {
        VoteOutcome::Waiting => 0,
        VoteOutcome::Approved => 1,
        VoteOutcome::Denied => 2,
    }
}

fn vote_outcome_from_db(value: i64) -> VoteOutcome {
    match value {
        0 => VoteOutcome::Waiting,
        1 => VoteOutcome::Approved,
        2 => VoteOutcome::Denied,
        _ => panic!("Unknown vote outcome: {}", value),
    }
}

pub struct Database {
    pool: Pool,
    grabbing_job_mutex: Mutex<()>,
}

impl Database {
    pub async fn new() -> Result<Self, Error> {
        Self::open(DB_PATH).await
    }

    /// Open (creating if needed) the database at the given sqlite URL.
    pub async fn open(db_path: &str) -> Result<Self, Error> {
        if !Sqlite::database_exists(db_path).await.unwrap_or(false) {
            Sqlite::create_database(db_path).await?;
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(32)
            .connect_with(
                SqliteConnectOptions::from_str(db_path)
                    .unwrap()
                    .pragma("cache_size", "-32768")
                    .busy_timeout(std::time::Duration::from_secs(600)),
            )
            .await?;

        // BAN_ALL_RECORDS:
        // record_id (key, i64)
        // action (0 for ban, 1 for unban)
        // target_userid (i64 because sqlite doesn't support u64)
        // requested_by (i64, same story)
        // reason (may be NULL)
        // outcome (0 waiting, 1 approved, 2 denied)
        // voters (committee and their votes, serialized as JSON)
        // status_chat_id / status_message_id (where the status message
        //     lives; NULL until it's posted)
        // created_at (date+time in UTC)
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS ban_all_records (
                record_id INTEGER PRIMARY KEY NOT NULL,
                action INTEGER NOT NULL,
                target_userid INTEGER NOT NULL,
                requested_by INTEGER NOT NULL,
                reason TEXT NULL,
                outcome INTEGER NOT NULL,
                voters TEXT NOT NULL,
                status_chat_id INTEGER NULL,
                status_message_id INTEGER NULL,
                created_at TEXT NOT NULL
            ) STRICT;",
        ))
        .await?;

        // PARENT_JOBS:
        // parent_id (key, i64)
        // record_id (the record this fan-out executes)
        // total_targets (fixed at submission; children are never added later)
        // processed/failed/ignored (last write of the recomputed aggregate)
        // completed (0 for no, 1 for yes)
        // completed_at (date+time in UTC, NULL while running)
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS parent_jobs (
                parent_id INTEGER PRIMARY KEY NOT NULL,
                record_id INTEGER NOT NULL REFERENCES ban_all_records(record_id),
                total_targets INTEGER NOT NULL,
                processed INTEGER NOT NULL,
                failed INTEGER NOT NULL,
                ignored INTEGER NOT NULL,
                completed INTEGER NOT NULL,
                completed_at TEXT NULL
            ) STRICT;",
        ))
        .await?;

        // CHILD_JOBS:
        // child_id (key, i64)
        // parent_id (owning fan-out)
        // chat_id (the one chat this job acts on)
        // target_userid (i64)
        // action (0 for ban, 1 for unban)
        // status (0 queued, 1 running, 2 succeeded, 3 failed, 4 ignored)
        // attempts (how many tries the terminal status took)
        // finished_at (date+time in UTC, NULL until terminal)
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS child_jobs (
                child_id INTEGER PRIMARY KEY NOT NULL,
                parent_id INTEGER NOT NULL REFERENCES parent_jobs(parent_id),
                chat_id INTEGER NOT NULL,
                target_userid INTEGER NOT NULL,
                action INTEGER NOT NULL,
                status INTEGER NOT NULL,
                attempts INTEGER NOT NULL,
                finished_at TEXT NULL
            ) STRICT;",
        ))
        .await?;

        // CHATS:
        // chat_id (key, i64)
        // title (may be NULL; purely for operator-facing logs)
        // present (whether the bot is still in there)
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS chats (
                chat_id INTEGER PRIMARY KEY NOT NULL,
                title TEXT NULL,
                present INTEGER NOT NULL
            ) STRICT;",
        ))
        .await?;

        let _ = sqlx::query("CREATE INDEX child_jobs_parent ON child_jobs(parent_id);")
            .execute(&pool)
            .await;
        let _ = sqlx::query("CREATE INDEX child_jobs_status ON child_jobs(status);")
            .execute(&pool)
            .await;
        let _ = sqlx::query("CREATE INDEX records_target ON ban_all_records(target_userid);")
            .execute(&pool)
            .await;

        // We're just starting, so nothing can be mid-execution. Anything
        // that was gets re-run; the remote actions are idempotent.
        pool.execute(sqlx::query("UPDATE child_jobs SET status=0 WHERE status=1;"))
            .await?;

        let woot = Database {
            pool,
            grabbing_job_mutex: Mutex::new(()),
        };

        woot.idle_cleanup().await;

        Ok(woot)
    }

    //
    // Records
    //

    #[allow(clippy::cast_possible_wrap)]
    pub async fn add_record(&self, record: &BanAllRecord) -> Result<i64, Error> {
        let voters_ser = serde_json::to_string(&record.voters).unwrap();
        let result = sqlx::query(
            "INSERT INTO ban_all_records (
                action,
                target_userid,
                requested_by,
                reason,
                outcome,
                voters,
                created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?);",
        )
        .bind(record.action as i64)
        .bind(record.target.0 as i64)
        .bind(record.requested_by.0 as i64)
        .bind(record.reason.as_deref())
        .bind(vote_outcome_to_db(record.outcome))
        .bind(voters_ser)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_record(&self, record_id: i64) -> Result<Option<BanAllRecord>, Error> {
        sqlx::query(
            "SELECT action, target_userid, requested_by, reason, outcome, voters
            FROM ban_all_records WHERE record_id=?;",
        )
        .bind(record_id)
        .map(|row: SqliteRow| BanAllRecord {
            action: ActionKind::from(row.get::<i64, _>(0)),
            target: UserId(row.get::<i64, _>(1) as u64),
            requested_by: UserId(row.get::<i64, _>(2) as u64),
            reason: row.get(3),
            outcome: vote_outcome_from_db(row.get(4)),
            voters: serde_json::from_str(row.get(5)).unwrap(),
        })
        .fetch_optional(&self.pool)
        .await
    }

    /// Write back the voter list and outcome after a vote was cast.
    pub async fn update_record_votes(
        &self,
        record_id: i64,
        record: &BanAllRecord,
    ) -> Result<(), Error> {
        let voters_ser = serde_json::to_string(&record.voters).unwrap();
        sqlx::query("UPDATE ban_all_records SET voters=?, outcome=? WHERE record_id=?;")
            .bind(voters_ser)
            .bind(vote_outcome_to_db(record.outcome))
            .bind(record_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_status_message(
        &self,
        record_id: i64,
        handle: StatusHandle,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE ban_all_records SET status_chat_id=?, status_message_id=?
            WHERE record_id=?;",
        )
        .bind(handle.chat_id.0)
        .bind(handle.message_id.0)
        .bind(record_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_status_message(&self, record_id: i64) -> Result<Option<StatusHandle>, Error> {
        let row = sqlx::query(
            "SELECT status_chat_id, status_message_id
            FROM ban_all_records WHERE record_id=?;",
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };

        let (Some(chat_id), Some(message_id)) = (
            row.get::<Option<i64>, _>(0),
            row.get::<Option<i32>, _>(1),
        ) else {
            return Ok(None);
        };

        Ok(Some(StatusHandle {
            chat_id: ChatId(chat_id),
            message_id: MessageId(message_id),
        }))
    }

    /// An undecided record for this user, if there is one. At most one is
    /// allowed open at a time.
    #[allow(clippy::cast_possible_wrap)]
    pub async fn find_open_record_for_target(
        &self,
        target: UserId,
    ) -> Result<Option<i64>, Error> {
        sqlx::query("SELECT record_id FROM ban_all_records WHERE target_userid=? AND outcome=0;")
            .bind(target.0 as i64)
            .map(|row: SqliteRow| row.get(0))
            .fetch_optional(&self.pool)
            .await
    }

    //
    // Chats
    //

    pub async fn upsert_chat(
        &self,
        chat_id: ChatId,
        title: Option<&str>,
        present: bool,
    ) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO chats (chat_id, title, present) VALUES (?, ?, ?)
            ON CONFLICT(chat_id) DO UPDATE SET title=excluded.title, present=excluded.present;",
        )
        .bind(chat_id.0)
        .bind(title)
        .bind(present)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    //
    // Jobs
    //

    /// Durably queue one fan-out: the parent plus one child per target,
    /// in a single transaction. Either all of it lands or none of it.
    #[allow(clippy::cast_possible_wrap)]
    pub async fn submit_fan_out(
        &self,
        record_id: i64,
        target: UserId,
        action: ActionKind,
        targets: &[ChatId],
    ) -> Result<i64, Error> {
        let mut tx = self.pool.begin().await?;

        let parent_id = sqlx::query(
            "INSERT INTO parent_jobs (
                record_id,
                total_targets,
                processed,
                failed,
                ignored,
                completed
            ) VALUES (?, ?, 0, 0, 0, 0);",
        )
        .bind(record_id)
        .bind(targets.len() as i64)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for chat in targets {
            sqlx::query(
                "INSERT INTO child_jobs (
                    parent_id,
                    chat_id,
                    target_userid,
                    action,
                    status,
                    attempts
                ) VALUES (?, ?, ?, ?, 0, 0);",
            )
            .bind(parent_id)
            .bind(chat.0)
            .bind(target.0 as i64)
            .bind(action as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(parent_id)
    }

    /// Take one queued child job off the queue and mark it running.
    pub async fn grab_child_job(&self) -> Result<Option<ChildJobInfo>, Error> {
        // Will be dropped by the end of this function
        let _mutex = self.grabbing_job_mutex.lock().await;

        let job = sqlx::query(
            "SELECT child_id, parent_id, chat_id, target_userid, action
            FROM child_jobs WHERE status=0 ORDER BY child_id LIMIT 1;",
        )
        .map(|row: SqliteRow| ChildJobInfo {
            child_id: row.get(0),
            parent_id: row.get(1),
            chat_id: ChatId(row.get(2)),
            target: UserId(row.get::<i64, _>(3) as u64),
            action: ActionKind::from(row.get::<i64, _>(4)),
        })
        .fetch_optional(&self.pool)
        .await?;

        let Some(job) = job else { return Ok(None) };

        sqlx::query("UPDATE child_jobs SET status=1 WHERE child_id=?;")
            .bind(job.child_id)
            .execute(&self.pool)
            .await?;

        Ok(Some(job))
    }

    pub async fn finish_child_job(
        &self,
        child_id: i64,
        outcome: ChildOutcome,
        attempts: u32,
    ) -> Result<(), Error> {
        sqlx::query("UPDATE child_jobs SET status=?, attempts=?, finished_at=? WHERE child_id=?;")
            .bind(outcome as i64)
            .bind(attempts as i64)
            .bind(Utc::now())
            .bind(child_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn running_parent_jobs(&self) -> Result<Vec<ParentJobInfo>, Error> {
        sqlx::query(
            "SELECT parent_id, record_id, total_targets, processed, failed, ignored, completed
            FROM parent_jobs WHERE completed=0;",
        )
        .map(ParentJobInfo::from_sqlite_row)
        .fetch_all(&self.pool)
        .await
    }

    /// Rederive a fan-out's aggregate from its child rows. The child
    /// table is the source of truth; this never trusts the counters
    /// previously written to the parent.
    pub async fn recompute_progress(&self, parent_id: i64) -> Result<ExecutionProgress, Error> {
        let total_targets: i64 =
            sqlx::query("SELECT total_targets FROM parent_jobs WHERE parent_id=?;")
                .bind(parent_id)
                .fetch_one(&self.pool)
                .await?
                .get(0);

        let row = sqlx::query(
            "SELECT
                COALESCE(SUM(status>=2), 0),
                COALESCE(SUM(status=3), 0),
                COALESCE(SUM(status=4), 0)
            FROM child_jobs WHERE parent_id=?;",
        )
        .bind(parent_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(ExecutionProgress {
            total_targets: total_targets as u32,
            processed: row.get::<i64, _>(0) as u32,
            failed: row.get::<i64, _>(1) as u32,
            ignored: row.get::<i64, _>(2) as u32,
        })
    }

    pub async fn store_parent_progress(
        &self,
        parent_id: i64,
        progress: &ExecutionProgress,
    ) -> Result<(), Error> {
        sqlx::query("UPDATE parent_jobs SET processed=?, failed=?, ignored=? WHERE parent_id=?;")
            .bind(progress.processed as i64)
            .bind(progress.failed as i64)
            .bind(progress.ignored as i64)
            .bind(parent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn complete_parent_job(&self, parent_id: i64) -> Result<(), Error> {
        sqlx::query("UPDATE parent_jobs SET completed=1, completed_at=? WHERE parent_id=?;")
            .bind(Utc::now())
            .bind(parent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The latest fan-out targeting this user, with its last written
    /// aggregate, or `None` if the user was never acted upon.
    #[allow(clippy::cast_possible_wrap)]
    pub async fn query_progress_for_target(
        &self,
        target: UserId,
    ) -> Result<Option<(ExecutionProgress, bool)>, Error> {
        sqlx::query(
            "SELECT
                parent_jobs.parent_id,
                parent_jobs.record_id,
                parent_jobs.total_targets,
                parent_jobs.processed,
                parent_jobs.failed,
                parent_jobs.ignored,
                parent_jobs.completed
            FROM parent_jobs
            JOIN ban_all_records ON ban_all_records.record_id = parent_jobs.record_id
            WHERE ban_all_records.target_userid=?
            ORDER BY parent_jobs.parent_id DESC LIMIT 1;",
        )
        .bind(target.0 as i64)
        .map(ParentJobInfo::from_sqlite_row)
        .fetch_optional(&self.pool)
        .await
        .map(|parent| parent.map(|p| (p.progress, p.completed)))
    }

    /// How many child jobs are still waiting for a worker.
    pub async fn count_queued_jobs(&self) -> Result<u32, Error> {
        let count: u32 = sqlx::query("SELECT COUNT(*) FROM child_jobs WHERE status=0;")
            .fetch_one(&self.pool)
            .await?
            .get(0);
        Ok(count)
    }

    //
    // Cleanup
    //

    pub async fn idle_cleanup(&self) {
        if let Err(e) = self.gc_finished_children().await {
            log::warn!("Retention cleanup failed: {}", e);
        }
        let _ = sqlx::query("VACUUM;").execute(&self.pool).await;
        let _ = sqlx::query("ANALYZE;").execute(&self.pool).await;
    }

    /// Drop terminal children of *completed* fan-outs past their
    /// retention. Children of running fan-outs are never touched: the
    /// aggregate is recomputed from them.
    async fn gc_finished_children(&self) -> Result<(), Error> {
        let now = Utc::now();
        let success_cutoff = now - Duration::hours(SUCCESS_RETENTION_HOURS);
        let failure_cutoff = now - Duration::hours(FAILURE_RETENTION_HOURS);

        sqlx::query(
            "DELETE FROM child_jobs
            WHERE status IN (2, 4) AND finished_at < ?
            AND parent_id IN (SELECT parent_id FROM parent_jobs WHERE completed=1);",
        )
        .bind(success_cutoff)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "DELETE FROM child_jobs
            WHERE status=3 AND finished_at < ?
            AND parent_id IN (SELECT parent_id FROM parent_jobs WHERE completed=1);",
        )
        .bind(failure_cutoff)
        .execute(&self.pool)
        .await?;

        // Row caps, newest kept.
        sqlx::query(
            "DELETE FROM child_jobs
            WHERE status IN (2, 4)
            AND parent_id IN (SELECT parent_id FROM parent_jobs WHERE completed=1)
            AND child_id NOT IN (
                SELECT child_id FROM child_jobs WHERE status IN (2, 4)
                ORDER BY child_id DESC LIMIT ?
            );",
        )
        .bind(RETENTION_MAX_ROWS)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "DELETE FROM child_jobs
            WHERE status=3
            AND parent_id IN (SELECT parent_id FROM parent_jobs WHERE completed=1)
            AND child_id NOT IN (
                SELECT child_id FROM child_jobs WHERE status=3
                ORDER BY child_id DESC LIMIT ?
            );",
        )
        .bind(RETENTION_MAX_ROWS)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

impl TargetLister for Database {
    async fn list_all_targets(&self) -> Result<Vec<ChatId>, ListTargetsError> {
        sqlx::query("SELECT chat_id FROM chats WHERE present=1 ORDER BY chat_id;")
            .map(|row: SqliteRow| ChatId(row.get(0)))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Box::new(e) as ListTargetsError)
    }
}
