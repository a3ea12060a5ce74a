use std::{
    collections::HashMap,
    fmt::Display,
    sync::{Arc, Weak},
    time::Duration,
};

pub mod database;
use database::{ChildOutcome, Database};
use teloxide::types::UserId;
use tokio::{
    sync::{watch, Mutex, Notify},
    time::sleep,
};

use super::{
    progress::broadcast_progress_spinjob, ActionOutcome, ActionRunner, BanAllRecord,
    ExecutionProgress, ListTargetsError, StatusHandle, StatusSink, TargetLister,
};
use crate::voting::VoteOutcome;

/// How many child jobs may execute at once.
const EXECUTION_WORKERS: u8 = 3;
/// Total tries for one child job, the first one included.
const MAX_ACTION_ATTEMPTS: u32 = 3;
/// Pause before the second attempt; doubles for each one after.
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum InitiateError {
    /// The committee has not approved this request.
    InvalidState(VoteOutcome),
    /// Listing the target chats failed. Nothing was queued.
    Enumeration(ListTargetsError),
    Database(database::Error),
}

impl Display for InitiateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidState(outcome) => {
                write!(f, "the request is not approved (vote state: {:?})", outcome)
            }
            Self::Enumeration(e) => write!(f, "failed to enumerate target chats: {}", e),
            Self::Database(e) => write!(f, "database error: {}", e),
        }
    }
}

pub struct Jobman<R, S> {
    pub db: Arc<Database>,
    runner: Arc<R>,
    sink: Arc<S>,
    // Arcs so the spinjobs can hold them independently of the jobman itself.
    submitted: Arc<Notify>,
    child_done: Arc<Notify>,
    broadcasts: Mutex<HashMap<i64, watch::Sender<ExecutionProgress>>>,
}

impl<R, S> Drop for Jobman<R, S> {
    fn drop(&mut self) {
        self.submitted.notify_waiters();
        self.child_done.notify_one();
    }
}

impl<R: ActionRunner, S: StatusSink> Jobman<R, S> {
    pub async fn new(db: Arc<Database>, runner: R, sink: S) -> Arc<Self> {
        let jobman = Arc::new(Self {
            db,
            runner: Arc::new(runner),
            sink: Arc::new(sink),
            submitted: Arc::new(Notify::new()),
            child_done: Arc::new(Notify::new()),
            broadcasts: Mutex::new(HashMap::new()),
        });

        // Pick up fan-outs that were still running when the process last
        // stopped: their interrupted children were requeued by the
        // database, but their status messages need broadcasters again.
        let running = jobman
            .db
            .running_parent_jobs()
            .await
            .expect("Database died!");
        for parent in running {
            let record = jobman
                .db
                .get_record(parent.record_id)
                .await
                .expect("Database died!");
            let Some(record) = record else { continue };
            let handle = jobman
                .db
                .get_status_message(parent.record_id)
                .await
                .expect("Database died!");
            jobman
                .attach_broadcast(parent.parent_id, record, handle, parent.progress)
                .await;
        }

        for _ in 0..EXECUTION_WORKERS {
            tokio::task::spawn(execution_spinjob(Arc::downgrade(&jobman)));
        }
        tokio::task::spawn(orchestration_spinjob(Arc::downgrade(&jobman)));

        jobman
    }

    /// Fan an approved request out across every known chat: one parent
    /// job plus one child per chat, queued atomically. Enumeration
    /// happens exactly once; if it fails, nothing at all is queued.
    pub async fn initiate<L: TargetLister>(
        &self,
        record_id: i64,
        record: &BanAllRecord,
        lister: &L,
    ) -> Result<i64, InitiateError> {
        if record.outcome != VoteOutcome::Approved {
            return Err(InitiateError::InvalidState(record.outcome));
        }

        let targets = lister
            .list_all_targets()
            .await
            .map_err(InitiateError::Enumeration)?;

        let parent_id = self
            .db
            .submit_fan_out(record_id, record.target, record.action, &targets)
            .await
            .map_err(InitiateError::Database)?;

        let handle = self
            .db
            .get_status_message(record_id)
            .await
            .map_err(InitiateError::Database)?;
        self.attach_broadcast(
            parent_id,
            record.clone(),
            handle,
            ExecutionProgress::new(targets.len() as u32),
        )
        .await;

        log::info!(
            "Submitted network-wide {} of user {} across {} chats (fan-out #{})",
            record.action,
            record.target,
            targets.len(),
            parent_id
        );

        // The workers may already have drained a tiny fan-out between the
        // submission and the broadcaster attaching above; in that case the
        // orchestration worker retired a sender that wasn't there yet, so
        // hand the broadcaster its final state ourselves.
        match self.db.recompute_progress(parent_id).await {
            Ok(progress) if progress.is_complete() => {
                self.retire_broadcast(parent_id, progress).await;
            }
            Ok(_) => (),
            Err(e) => log::warn!("Could not recheck fan-out #{}: {}", parent_id, e),
        }

        // Wake the workers. A fan-out over zero chats has no children;
        // poking the orchestration worker completes it right away.
        self.submitted.notify_waiters();
        self.child_done.notify_one();

        Ok(parent_id)
    }

    /// The last written aggregate of the latest fan-out against this
    /// user, and whether that fan-out is done.
    pub async fn query_progress(
        &self,
        target: UserId,
    ) -> Result<Option<(ExecutionProgress, bool)>, database::Error> {
        self.db.query_progress_for_target(target).await
    }

    async fn attach_broadcast(
        &self,
        parent_id: i64,
        record: BanAllRecord,
        handle: Option<StatusHandle>,
        initial: ExecutionProgress,
    ) {
        let (tx, rx) = watch::channel(initial);
        self.broadcasts.lock().await.insert(parent_id, tx);
        // No status message means nowhere to render; the sender then
        // only keeps the aggregate flowing into the void.
        if let Some(handle) = handle {
            tokio::task::spawn(broadcast_progress_spinjob(
                self.sink.clone(),
                handle,
                record,
                rx,
            ));
        }
    }

    async fn push_progress(&self, parent_id: i64, progress: ExecutionProgress) {
        if let Some(tx) = self.broadcasts.lock().await.get(&parent_id) {
            let _ = tx.send(progress);
        }
    }

    /// Send the final aggregate and drop the sender; the broadcaster
    /// renders it and winds down.
    async fn retire_broadcast(&self, parent_id: i64, finished: ExecutionProgress) {
        if let Some(tx) = self.broadcasts.lock().await.remove(&parent_id) {
            let _ = tx.send(finished);
        }
    }
}

/// One worker slot: grab a child job, apply its action with retries,
/// record the terminal state, poke the orchestration worker. One chat
/// failing is strictly that chat's problem.
pub async fn execution_spinjob<R: ActionRunner, S: StatusSink>(jobman: Weak<Jobman<R, S>>) {
    loop {
        let Some(jobman) = jobman.upgrade() else {
            return;
        };

        // Just in case, *before* we look for a job.
        let notify = jobman.submitted.clone();
        let notified = notify.notified();

        let Some(job) = jobman.db.grab_child_job().await.expect("Database died!") else {
            // No jobs. Vacuum the database?
            jobman.db.idle_cleanup().await;
            drop(jobman);
            notified.await;
            continue;
        };

        let mut attempts: u32 = 1;
        let mut result = jobman
            .runner
            .apply_action(job.chat_id, job.target, job.action)
            .await;
        while result.is_err() && attempts < MAX_ACTION_ATTEMPTS {
            // 1 second, then 2.
            sleep(RETRY_BASE_DELAY * (1 << (attempts - 1))).await;
            result = jobman
                .runner
                .apply_action(job.chat_id, job.target, job.action)
                .await;
            attempts += 1;
        }

        let outcome = match result {
            Ok(ActionOutcome::Applied) => ChildOutcome::Succeeded,
            Ok(ActionOutcome::Ignored) => ChildOutcome::Ignored,
            Err(e) => {
                log::warn!(
                    "Giving up on the {} of user {} in chat {} after {} attempts: {:?}",
                    job.action,
                    job.target,
                    job.chat_id,
                    attempts,
                    e
                );
                ChildOutcome::Failed
            }
        };

        jobman
            .db
            .finish_child_job(job.child_id, outcome, attempts)
            .await
            .expect("Database died!");

        jobman.child_done.notify_one();
    }
}

/// The single aggregator: whenever any child finishes, rederive every
/// running fan-out's counters from the child rows and publish them.
/// When the last child of a fan-out is in, complete it and log the
/// summary, once.
pub async fn orchestration_spinjob<R: ActionRunner, S: StatusSink>(jobman: Weak<Jobman<R, S>>) {
    loop {
        let Some(jobman) = jobman.upgrade() else {
            return;
        };

        let notify = jobman.child_done.clone();
        let notified = notify.notified();

        let parents = jobman
            .db
            .running_parent_jobs()
            .await
            .expect("Database died!");
        for parent in parents {
            // Always rederived from the child rows; a crash between a
            // child finishing and this write cannot skew the aggregate.
            let progress = jobman
                .db
                .recompute_progress(parent.parent_id)
                .await
                .expect("Database died!");
            jobman
                .db
                .store_parent_progress(parent.parent_id, &progress)
                .await
                .expect("Database died!");

            if progress.is_complete() {
                jobman
                    .db
                    .complete_parent_job(parent.parent_id)
                    .await
                    .expect("Database died!");
                log::info!(
                    "Fan-out #{} finished: {} processed, {} failed, {} ignored",
                    parent.parent_id,
                    progress.processed,
                    progress.failed,
                    progress.ignored
                );
                jobman.retire_broadcast(parent.parent_id, progress).await;
            } else {
                jobman.push_progress(parent.parent_id, progress).await;
            }
        }

        drop(jobman);
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    use teloxide::{types::ChatId, ApiError, RequestError};

    use super::*;
    use crate::banall::{ActionKind, ActionOutcome};
    use crate::voting::VoteChoice;

    #[derive(Clone, Default)]
    struct MockRunner {
        fail_chats: HashSet<ChatId>,
        ignore_chats: HashSet<ChatId>,
        calls: Arc<StdMutex<HashMap<ChatId, u32>>>,
    }

    impl ActionRunner for MockRunner {
        async fn apply_action(
            &self,
            chat: ChatId,
            _user: UserId,
            _action: ActionKind,
        ) -> Result<ActionOutcome, RequestError> {
            *self.calls.lock().unwrap().entry(chat).or_insert(0) += 1;
            if self.fail_chats.contains(&chat) {
                return Err(RequestError::Api(ApiError::Unknown(
                    "injected failure".to_string(),
                )));
            }
            if self.ignore_chats.contains(&chat) {
                return Ok(ActionOutcome::Ignored);
            }
            Ok(ActionOutcome::Applied)
        }
    }

    #[derive(Clone, Default)]
    struct MockSink {
        renders: Arc<StdMutex<Vec<String>>>,
    }

    impl StatusSink for MockSink {
        async fn update_status(
            &self,
            _handle: StatusHandle,
            text: &str,
        ) -> Result<(), RequestError> {
            self.renders.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct MockLister(Vec<ChatId>);

    impl TargetLister for MockLister {
        async fn list_all_targets(&self) -> Result<Vec<ChatId>, ListTargetsError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenLister;

    impl TargetLister for BrokenLister {
        async fn list_all_targets(&self) -> Result<Vec<ChatId>, ListTargetsError> {
            Err("chat roster unavailable".into())
        }
    }

    async fn test_db() -> (Arc<Database>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = format!("sqlite:{}/test.sqlite", dir.path().display());
        let db = Arc::new(Database::open(&path).await.unwrap());
        (db, dir)
    }

    fn approved_record() -> BanAllRecord {
        let mut record = BanAllRecord::new(ActionKind::Ban, UserId(7777), crate::OWNER_ID, None);
        let committee: Vec<UserId> = record.voters.iter().map(|v| v.user_id).collect();
        for member in &committee[..record.majority()] {
            record.cast_vote(*member, VoteChoice::InFavor).unwrap();
        }
        assert_eq!(record.outcome, VoteOutcome::Approved);
        record
    }

    #[tokio::test]
    async fn initiate_rejects_an_undecided_record() {
        let (db, _dir) = test_db().await;
        let record = BanAllRecord::new(ActionKind::Ban, UserId(7777), crate::OWNER_ID, None);
        let record_id = db.add_record(&record).await.unwrap();

        let jobman = Jobman::new(db.clone(), MockRunner::default(), MockSink::default()).await;
        let result = jobman
            .initiate(record_id, &record, &MockLister(vec![ChatId(-1)]))
            .await;

        assert!(matches!(
            result,
            Err(InitiateError::InvalidState(VoteOutcome::Waiting))
        ));
        // No side effects whatsoever.
        assert_eq!(db.count_queued_jobs().await.unwrap(), 0);
        assert_eq!(db.running_parent_jobs().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn enumeration_failure_queues_nothing() {
        let (db, _dir) = test_db().await;
        let record = approved_record();
        let record_id = db.add_record(&record).await.unwrap();

        let jobman = Jobman::new(db.clone(), MockRunner::default(), MockSink::default()).await;
        let result = jobman.initiate(record_id, &record, &BrokenLister).await;

        assert!(matches!(result, Err(InitiateError::Enumeration(_))));
        assert_eq!(db.count_queued_jobs().await.unwrap(), 0);
        assert_eq!(db.running_parent_jobs().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn fan_out_runs_to_completion_with_isolated_failures() {
        let (db, _dir) = test_db().await;
        let record = approved_record();
        let record_id = db.add_record(&record).await.unwrap();
        db.set_status_message(
            record_id,
            StatusHandle {
                chat_id: ChatId(555),
                message_id: teloxide::types::MessageId(1),
            },
        )
        .await
        .unwrap();

        let bad_chat = ChatId(-3);
        let skipped_chat = ChatId(-4);
        let runner = MockRunner {
            fail_chats: HashSet::from([bad_chat]),
            ignore_chats: HashSet::from([skipped_chat]),
            calls: Arc::default(),
        };
        let calls = runner.calls.clone();
        let sink = MockSink::default();
        let renders = sink.renders.clone();

        let jobman = Jobman::new(db.clone(), runner, sink).await;
        let targets: Vec<ChatId> = (1..=5).map(|i| ChatId(-i)).collect();
        jobman
            .initiate(record_id, &record, &MockLister(targets))
            .await
            .unwrap();

        // The failing chat backs off for 1s+2s; give the whole thing
        // plenty of real time to drain.
        let progress = {
            let mut waited = 0;
            loop {
                if let Some((progress, true)) =
                    jobman.query_progress(UserId(7777)).await.unwrap()
                {
                    break progress;
                }
                waited += 1;
                assert!(waited < 300, "fan-out did not finish in time");
                sleep(Duration::from_millis(100)).await;
            }
        };

        assert_eq!(progress.total_targets, 5);
        assert_eq!(progress.processed, 5);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.ignored, 1);
        assert_eq!(progress.succeeded(), 3);

        // The failing chat was tried exactly 3 times and counted as
        // failed exactly once; everyone else got one call.
        let calls = calls.lock().unwrap();
        assert_eq!(calls[&bad_chat], 3);
        for chat in (1..=5).map(|i| ChatId(-i)).filter(|c| *c != bad_chat) {
            assert_eq!(calls[&chat], 1);
        }

        // The final state reaches the status message, eventually.
        let mut waited = 0;
        loop {
            if renders.lock().unwrap().iter().any(|r| r.contains("Finished")) {
                break;
            }
            waited += 1;
            assert!(waited < 300, "final render never arrived");
            sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test]
    async fn zero_targets_completes_immediately() {
        let (db, _dir) = test_db().await;
        let record = approved_record();
        let record_id = db.add_record(&record).await.unwrap();

        let jobman = Jobman::new(db.clone(), MockRunner::default(), MockSink::default()).await;
        jobman
            .initiate(record_id, &record, &MockLister(Vec::new()))
            .await
            .unwrap();

        let mut waited = 0;
        loop {
            if let Some((progress, true)) = jobman.query_progress(UserId(7777)).await.unwrap() {
                assert_eq!(progress.total_targets, 0);
                assert_eq!(progress.processed, 0);
                break;
            }
            waited += 1;
            assert!(waited < 100, "empty fan-out never completed");
            sleep(Duration::from_millis(100)).await;
        }
    }
}
