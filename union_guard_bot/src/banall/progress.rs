use std::sync::Arc;
use std::time::Duration;

use tokio::{sync::watch, time::sleep};

use super::{BanAllRecord, ExecutionProgress, StatusHandle, StatusSink};

/// Minimum gap between two renders of the same status message. Children
/// finish much faster than this; without the throttle every completion
/// would hit the presentation layer.
const BROADCAST_THROTTLE: Duration = Duration::from_secs(5);

/// Keeps one fan-out's status message current. Renders the freshest
/// aggregate, at most once per throttle window, until the final state
/// has been rendered. Whatever arrives mid-window is rendered at the
/// window's end, so the last word always makes it out.
///
/// Render failures only cost observability; the next successful render
/// catches the message up.
pub async fn broadcast_progress_spinjob<S: StatusSink>(
    sink: Arc<S>,
    handle: StatusHandle,
    record: BanAllRecord,
    mut progress: watch::Receiver<ExecutionProgress>,
) {
    loop {
        let snapshot = *progress.borrow_and_update();
        let text = record.produce_status_message(Some(&snapshot));
        if let Err(e) = sink.update_status(handle, &text).await {
            log::warn!(
                "Failed to update the status message for the {} of user {}: {:?}",
                record.action,
                record.target,
                e
            );
        }
        if snapshot.is_complete() {
            return;
        }

        sleep(BROADCAST_THROTTLE).await;
        if progress.changed().await.is_err() {
            // The jobman is gone and everything sent has been rendered.
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use teloxide::{
        types::{ChatId, MessageId, UserId},
        RequestError,
    };

    use super::*;
    use crate::banall::ActionKind;

    #[derive(Clone, Default)]
    struct RecordingSink {
        renders: Arc<StdMutex<Vec<String>>>,
    }

    impl StatusSink for RecordingSink {
        async fn update_status(
            &self,
            _handle: StatusHandle,
            text: &str,
        ) -> Result<(), RequestError> {
            self.renders.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn approved_record() -> BanAllRecord {
        let mut record = BanAllRecord::new(ActionKind::Ban, UserId(7777), crate::OWNER_ID, None);
        record.outcome = crate::voting::VoteOutcome::Approved;
        record
    }

    #[tokio::test]
    async fn renders_trail_to_the_final_state() {
        let sink = RecordingSink::default();
        let renders = sink.renders.clone();
        let handle = StatusHandle {
            chat_id: ChatId(555),
            message_id: MessageId(1),
        };

        let (tx, rx) = watch::channel(ExecutionProgress::new(4));
        let broadcaster = tokio::spawn(broadcast_progress_spinjob(
            Arc::new(sink),
            handle,
            approved_record(),
            rx,
        ));

        // Let the initial render happen first.
        let mut waited = 0;
        while renders.lock().unwrap().is_empty() {
            waited += 1;
            assert!(waited < 100, "initial render never happened");
            sleep(Duration::from_millis(10)).await;
        }

        // A burst of updates inside one throttle window; only the last
        // one matters.
        for processed in 1..=4 {
            tx.send(ExecutionProgress {
                total_targets: 4,
                processed,
                failed: 0,
                ignored: 0,
            })
            .unwrap();
        }
        drop(tx);

        broadcaster.await.unwrap();

        let renders = renders.lock().unwrap();
        // The initial render, then (after the window) the final one.
        // The intermediate burst never produced a render of its own.
        assert!(renders.len() <= 3);
        assert!(renders.first().unwrap().contains("0 done"));
        assert!(renders.last().unwrap().contains("Finished"));
    }

    #[tokio::test]
    async fn completes_without_rendering_twice_when_already_done() {
        let sink = RecordingSink::default();
        let renders = sink.renders.clone();
        let handle = StatusHandle {
            chat_id: ChatId(555),
            message_id: MessageId(1),
        };

        let (tx, rx) = watch::channel(ExecutionProgress {
            total_targets: 2,
            processed: 2,
            failed: 1,
            ignored: 0,
        });
        broadcast_progress_spinjob(Arc::new(sink), handle, approved_record(), rx).await;
        drop(tx);

        let renders = renders.lock().unwrap();
        assert_eq!(renders.len(), 1);
        assert!(renders[0].contains("Finished"));
    }
}
