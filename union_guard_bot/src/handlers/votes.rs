use std::sync::Arc;

use guard_bot_commons::teloxide_retry;
use html_escape::encode_text;
use teloxide::{
    payloads::{AnswerCallbackQuerySetters, EditMessageTextSetters},
    prelude::Requester,
    types::{CallbackQuery, InlineKeyboardMarkup, ParseMode},
    Bot, RequestError,
};

use crate::{
    banall::{jobman::database::Database, StatusHandle, VoteError},
    voting::{VoteChoice, VoteOutcome},
    BotJobman,
};

/// Committee votes arrive here as presses on the status message's
/// inline keyboard, as `VOTE <record_id> <FOR|AGAINST|ABSTAIN>`.
pub async fn handle_callback_query(
    bot: Bot,
    query: CallbackQuery,
    db: Arc<Database>,
    jobman: Arc<BotJobman>,
) -> Result<(), RequestError> {
    macro_rules! goodbye {
        ($text:expr) => {{
            bot.answer_callback_query(query.id.clone()).text($text).await?;
            return Ok(());
        }};
    }

    let Some(query_data) = &query.data else {
        goodbye!("No query data.");
    };

    let mut parts = query_data.split_ascii_whitespace();
    if parts.next() != Some("VOTE") {
        goodbye!("Unknown query data.");
    }
    let Some(record_id) = parts.next().and_then(|x| x.parse::<i64>().ok()) else {
        goodbye!("Malformed query data.");
    };
    let choice = match parts.next() {
        Some("FOR") => VoteChoice::InFavor,
        Some("AGAINST") => VoteChoice::Against,
        Some("ABSTAIN") => VoteChoice::Abstained,
        _ => {
            goodbye!("Malformed query data.");
        }
    };
    if parts.next().is_some() {
        goodbye!("Malformed query data.");
    }

    let voter = &query.from;

    let Some(mut record) = db.get_record(record_id).await.expect("Database died!") else {
        goodbye!("This vote no longer exists.");
    };

    let outcome = match record.cast_vote(voter.id, choice) {
        Ok(outcome) => outcome,
        Err(VoteError::NotInCommittee) => {
            log::info!(
                "Non-committee user {} tried to vote on record #{}",
                voter.id,
                record_id
            );
            goodbye!("You are not part of the moderation committee.");
        }
        Err(VoteError::AlreadyVoted) => {
            goodbye!("You have already voted on this request.");
        }
        Err(VoteError::AlreadyDecided) => {
            goodbye!("This vote has already concluded.");
        }
        Err(VoteError::Committee(e)) => {
            // Wrong committee size or chair count is an operator-level
            // configuration bug, not a vote state.
            log::error!("Committee misconfigured, record #{} cannot proceed: {}", record_id, e);
            goodbye!("The committee is misconfigured. The bot's owner has to fix this.");
        }
    };

    log::info!(
        "Committee member {} voted {} on record #{}; now {:?}",
        voter.id,
        choice,
        record_id,
        outcome
    );

    db.update_record_votes(record_id, &record)
        .await
        .expect("Database died!");

    let handle = db
        .get_status_message(record_id)
        .await
        .expect("Database died!");

    match outcome {
        VoteOutcome::Waiting => {
            rerender_status(&bot, handle, &record, true, record_id).await;
            goodbye!("Vote registered.");
        }
        VoteOutcome::Denied => {
            rerender_status(&bot, handle, &record, false, record_id).await;
            goodbye!("Vote registered. The request was denied.");
        }
        VoteOutcome::Approved => {
            rerender_status(&bot, handle, &record, false, record_id).await;

            match jobman.initiate(record_id, &record, db.as_ref()).await {
                Ok(parent_id) => {
                    log::info!(
                        "Record #{} approved; fan-out #{} submitted",
                        record_id,
                        parent_id
                    );
                    goodbye!("Vote registered. The action is approved and now running.");
                }
                Err(e) => {
                    // Nothing was queued. Leave the record approved and
                    // put the failure where the committee is looking.
                    log::error!("Failed to start the fan-out for record #{}: {}", record_id, e);
                    if let Some(handle) = handle {
                        let _ = bot
                            .edit_message_text(
                                handle.chat_id,
                                handle.message_id,
                                format!(
                                    "{}\n\nFailed to start the action: {}",
                                    record.produce_status_message(None),
                                    encode_text(&e.to_string())
                                ),
                            )
                            .parse_mode(ParseMode::Html)
                            .await;
                    }
                    goodbye!("Vote registered, but starting the action failed.");
                }
            }
        }
    }
}

/// Re-render the status message after a vote, keeping the vote keyboard
/// only while the vote is still open. Not being able to edit is no
/// reason to fail the vote itself.
async fn rerender_status(
    bot: &Bot,
    handle: Option<StatusHandle>,
    record: &crate::banall::BanAllRecord,
    keep_keyboard: bool,
    record_id: i64,
) {
    let Some(handle) = handle else { return };

    let keyboard = if keep_keyboard {
        super::vote_keyboard(record_id)
    } else {
        InlineKeyboardMarkup {
            inline_keyboard: Vec::new(),
        }
    };

    let text = record.produce_status_message(None);
    let result = teloxide_retry!(
        bot.edit_message_text(handle.chat_id, handle.message_id, text.clone())
            .parse_mode(ParseMode::Html)
            .reply_markup(keyboard.clone())
            .await
    );

    if let Err(e) = result {
        log::warn!("Failed to re-render the status of record #{}: {:?}", record_id, e);
    }
}
