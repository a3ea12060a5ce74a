mod banall;
mod entry;
mod handlers;
mod voting;

pub use entry::*;

use teloxide::types::UserId;

const OWNER_ID: UserId = UserId(1459074222);

/// The moderation committee that signs off on network-wide actions.
/// The second field marks the chair; exactly one member has it set,
/// and their vote breaks ties.
const COMMITTEE: &[(UserId, bool)] = &[
    (OWNER_ID, true),
    (UserId(839042601), false),
    (UserId(1204522205), false),
    (UserId(5297814119), false),
    (UserId(746112840), false),
];

pub(crate) fn is_committee_member(user: UserId) -> bool {
    COMMITTEE.iter().any(|(member, _)| *member == user)
}

/// The one concrete jobman this bot runs, wired to the real Telegram API.
pub(crate) type BotJobman =
    banall::jobman::Jobman<banall::telegram::TelegramActions, banall::telegram::TelegramStatus>;
