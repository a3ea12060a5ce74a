pub mod jobman;
pub mod progress;
pub mod telegram;

use std::fmt::{Display, Write};
use std::future::Future;

use html_escape::encode_text;
use serde::{Deserialize, Serialize};
use teloxide::{
    types::{ChatId, MessageId, UserId},
    RequestError,
};

use crate::voting::{calculate_outcome, CommitteeError, VoteChoice, VoteOutcome, Voter};
use crate::COMMITTEE;

/// Which destructive action the committee is voting on.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActionKind {
    Ban = 0,
    Unban = 1,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ban => "ban",
            Self::Unban => "unban",
        }
    }

    /// "banning"/"unbanning", for progress lines.
    pub fn as_gerund(&self) -> &'static str {
        match self {
            Self::Ban => "banning",
            Self::Unban => "unbanning",
        }
    }
}

impl From<i64> for ActionKind {
    fn from(value: i64) -> Self {
        match value {
            value if value == Self::Ban as i64 => Self::Ban,
            value if value == Self::Unban as i64 => Self::Unban,
            _ => panic!("Unknown action kind: {}", value),
        }
    }
}

impl Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One network-wide moderation request: who is targeted, who asked,
/// where the committee stands, and (once approved) how the fan-out
/// is doing. Never deleted; a decided record is simply terminal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BanAllRecord {
    pub action: ActionKind,
    pub target: UserId,
    pub requested_by: UserId,
    pub reason: Option<String>,
    pub outcome: VoteOutcome,
    pub voters: Vec<Voter>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VoteError {
    NotInCommittee,
    AlreadyVoted,
    AlreadyDecided,
    Committee(CommitteeError),
}

impl Display for VoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInCommittee => write!(f, "voter is not part of the committee"),
            Self::AlreadyVoted => write!(f, "voter has already cast their vote"),
            Self::AlreadyDecided => write!(f, "the vote has already concluded"),
            Self::Committee(e) => write!(f, "{}", e),
        }
    }
}

impl BanAllRecord {
    /// A fresh request with the configured committee and no votes cast.
    pub fn new(
        action: ActionKind,
        target: UserId,
        requested_by: UserId,
        reason: Option<String>,
    ) -> Self {
        Self {
            action,
            target,
            requested_by,
            reason,
            outcome: VoteOutcome::Waiting,
            voters: COMMITTEE
                .iter()
                .map(|&(user_id, is_chair)| Voter {
                    user_id,
                    is_chair,
                    vote: None,
                })
                .collect(),
        }
    }

    pub fn majority(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    pub fn votes_cast(&self) -> usize {
        self.voters.iter().filter(|v| v.vote.is_some()).count()
    }

    /// Register one vote and recompute the outcome. Rejections leave the
    /// record untouched.
    pub fn cast_vote(
        &mut self,
        from: UserId,
        choice: VoteChoice,
    ) -> Result<VoteOutcome, VoteError> {
        if self.outcome != VoteOutcome::Waiting {
            return Err(VoteError::AlreadyDecided);
        }
        // Surface a misconfigured committee before touching any vote.
        calculate_outcome(&self.voters).map_err(VoteError::Committee)?;

        let Some(voter) = self.voters.iter_mut().find(|v| v.user_id == from) else {
            return Err(VoteError::NotInCommittee);
        };
        if voter.vote.is_some() {
            return Err(VoteError::AlreadyVoted);
        }
        voter.vote = Some(choice);

        // The committee shape was just validated, so this cannot fail.
        self.outcome = calculate_outcome(&self.voters).map_err(VoteError::Committee)?;
        Ok(self.outcome)
    }

    /// The HTML status message for this request, optionally with fan-out
    /// progress once one is running.
    pub fn produce_status_message(&self, progress: Option<&ExecutionProgress>) -> String {
        let mut text = format!(
            "<b>Network-wide {}</b> of user <code>{}</code>, requested by <code>{}</code>.\n",
            self.action, self.target, self.requested_by
        );
        if let Some(reason) = &self.reason {
            writeln!(text, "Reason: {}", encode_text(reason)).unwrap();
        }

        match self.outcome {
            VoteOutcome::Waiting => {
                let mut in_favor = 0;
                let mut against = 0;
                let mut abstained = 0;
                for voter in &self.voters {
                    match voter.vote {
                        Some(VoteChoice::InFavor) => in_favor += 1,
                        Some(VoteChoice::Against) => against += 1,
                        Some(VoteChoice::Abstained) => abstained += 1,
                        None => (),
                    }
                }
                write!(
                    text,
                    "\nCommittee vote in progress: {} of {} votes cast \
                    ({} needed for a majority).\n\
                    In favor: {}, against: {}, abstained: {}",
                    self.votes_cast(),
                    self.voters.len(),
                    self.majority(),
                    in_favor,
                    against,
                    abstained
                )
                .unwrap();
            }
            VoteOutcome::Denied => {
                write!(text, "\nDenied by committee vote. No action was taken.").unwrap();
            }
            VoteOutcome::Approved => match progress {
                None => {
                    write!(
                        text,
                        "\nApproved by committee vote. Preparing to {} across all chats...",
                        self.action
                    )
                    .unwrap();
                }
                Some(progress) if progress.is_complete() => {
                    write!(
                        text,
                        "\nFinished {} across {} chats: {} done, {} failed, {} skipped.",
                        self.action.as_gerund(),
                        progress.total_targets,
                        progress.succeeded(),
                        progress.failed,
                        progress.ignored
                    )
                    .unwrap();
                }
                Some(progress) => {
                    write!(
                        text,
                        "\nApproved. Now {} across {} chats: \
                        {} done, {} failed, {} pending.",
                        self.action.as_gerund(),
                        progress.total_targets,
                        progress.succeeded(),
                        progress.failed,
                        progress.pending()
                    )
                    .unwrap();
                }
            },
        }

        text
    }
}

/// Aggregate state of one fan-out. `total_targets` is fixed when the
/// fan-out is submitted; the buckets are always rederived from the
/// child jobs, never incremented in place.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecutionProgress {
    pub total_targets: u32,
    /// Children in any terminal state.
    pub processed: u32,
    pub failed: u32,
    pub ignored: u32,
}

impl ExecutionProgress {
    pub fn new(total_targets: u32) -> Self {
        Self {
            total_targets,
            ..Self::default()
        }
    }

    pub fn succeeded(&self) -> u32 {
        self.processed - self.failed - self.ignored
    }

    pub fn pending(&self) -> u32 {
        self.total_targets - self.processed
    }

    pub fn is_complete(&self) -> bool {
        self.processed >= self.total_targets
    }
}

/// Where the human-facing status message for a request lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusHandle {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// What applying the action to one chat came to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionOutcome {
    Applied,
    /// Nothing to do in this chat (gone, no rights, and the like).
    Ignored,
}

pub type ListTargetsError = Box<dyn std::error::Error + Send + Sync>;

/// Enumerates every chat a fan-out should cover. Called once per
/// fan-out; a failure aborts the whole submission.
pub trait TargetLister: Sync {
    fn list_all_targets(
        &self,
    ) -> impl Future<Output = Result<Vec<ChatId>, ListTargetsError>> + Send;
}

/// Applies one ban/unban to one chat. Must be idempotent; the worker
/// pool retries it on errors.
pub trait ActionRunner: Send + Sync + 'static {
    fn apply_action(
        &self,
        chat: ChatId,
        user: UserId,
        action: ActionKind,
    ) -> impl Future<Output = Result<ActionOutcome, RequestError>> + Send;
}

/// Pushes a rendered status text into a previously posted message.
pub trait StatusSink: Send + Sync + 'static {
    fn update_status(
        &self,
        handle: StatusHandle,
        text: &str,
    ) -> impl Future<Output = Result<(), RequestError>> + Send;
}
