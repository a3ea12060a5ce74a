pub mod votes;

use std::sync::Arc;

use guard_bot_commons::BotSendHtml;
use teloxide::{
    payloads::SendMessageSetters,
    prelude::*,
    types::{BotCommand, ChatMemberUpdated, InlineKeyboardButton, InlineKeyboardMarkup, Me, UserId},
    RequestError,
};

use crate::{
    banall::{jobman::database::Database, ActionKind, BanAllRecord, StatusHandle},
    BotJobman,
};

const HELP: &str = concat!(
    "This bot guards a union of chats. Its moderation committee can vote to ",
    "ban or unban a user in every chat of the union at once.\n\n",
    "<code>/banall</code> - Request a network-wide ban. Reply to the user, or ",
    "give their numeric ID; anything after that is the reason. Committee only.\n",
    "<code>/unbanall</code> - Same, but lifting a ban.\n",
    "<code>/progress</code> - How a network-wide action against a user ",
    "(reply or numeric ID) is coming along.\n",
    "<code>/help</code> - This message."
);

pub fn generate_bot_commands() -> Vec<BotCommand> {
    vec![
        BotCommand {
            command: "banall".to_string(),
            description: "Request a network-wide ban (committee only).".to_string(),
        },
        BotCommand {
            command: "unbanall".to_string(),
            description: "Request a network-wide unban (committee only).".to_string(),
        },
        BotCommand {
            command: "progress".to_string(),
            description: "Check on a network-wide action.".to_string(),
        },
        BotCommand {
            command: "help".to_string(),
            description: "What is this bot?".to_string(),
        },
    ]
}

/// The inline keyboard the committee votes with.
pub(crate) fn vote_keyboard(record_id: i64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback("In favor".to_string(), format!("VOTE {} FOR", record_id)),
        InlineKeyboardButton::callback("Against".to_string(), format!("VOTE {} AGAINST", record_id)),
        InlineKeyboardButton::callback("Abstain".to_string(), format!("VOTE {} ABSTAIN", record_id)),
    ]])
}

pub async fn handle_message(
    bot: Bot,
    me: Me,
    message: Message,
    db: Arc<Database>,
    jobman: Arc<BotJobman>,
) -> Result<(), RequestError> {
    // Keep the chat roster fresh; it's what fan-outs enumerate.
    if !message.chat.is_private() {
        db.upsert_chat(message.chat.id, message.chat.title(), true)
            .await
            .expect("Database died!");
    }

    let Some(text) = message.text() else {
        return Ok(());
    };
    if !text.starts_with('/') {
        return Ok(());
    }
    let Some(command) = text.split_whitespace().next() else {
        return Ok(());
    };

    // "/banall@Union_Guard_Bot" is for us; "/banall@SomeOtherBot" is not.
    let command = match command.split_once('@') {
        Some((command, username)) => {
            if !username.eq_ignore_ascii_case(me.username()) {
                return Ok(());
            }
            command
        }
        None => command,
    };

    match command.to_ascii_lowercase().as_str() {
        "/banall" => handle_union_action(&bot, &message, &db, ActionKind::Ban).await,
        "/unbanall" => handle_union_action(&bot, &message, &db, ActionKind::Unban).await,
        "/progress" => handle_progress(&bot, &message, &jobman).await,
        "/help" | "/start" => {
            bot.send_html(message.chat.id, HELP, message.id).await?;
            Ok(())
        }
        _ => Ok(()),
    }
}

/// The target a command is aimed at: the replied-to user, or the first
/// argument parsed as a numeric ID. Everything after is the reason.
fn resolve_target(message: &Message) -> Option<(UserId, Option<String>)> {
    let text = message.text().unwrap_or_default();
    let mut args = text.split_whitespace().skip(1);

    if let Some(replied) = message.reply_to_message().and_then(|m| m.from.as_ref()) {
        let reason = args.collect::<Vec<_>>().join(" ");
        return Some((replied.id, (!reason.is_empty()).then_some(reason)));
    }

    let id: u64 = args.next()?.parse().ok()?;
    let reason = args.collect::<Vec<_>>().join(" ");
    Some((UserId(id), (!reason.is_empty()).then_some(reason)))
}

async fn handle_union_action(
    bot: &Bot,
    message: &Message,
    db: &Database,
    action: ActionKind,
) -> Result<(), RequestError> {
    let Some(sender) = &message.from else {
        return Ok(());
    };

    if !crate::is_committee_member(sender.id) {
        bot.send_html(
            message.chat.id,
            "Only the moderation committee can request network-wide actions.",
            message.id,
        )
        .await?;
        return Ok(());
    }

    let Some((target, reason)) = resolve_target(message) else {
        bot.send_html(
            message.chat.id,
            concat!(
                "Who? Reply to a message of the user, or give their numeric ID. ",
                "Anything after the ID is recorded as the reason."
            ),
            message.id,
        )
        .await?;
        return Ok(());
    };

    if crate::is_committee_member(target) {
        bot.send_html(
            message.chat.id,
            "Committee members cannot be targeted by network-wide actions.",
            message.id,
        )
        .await?;
        return Ok(());
    }

    if db
        .find_open_record_for_target(target)
        .await
        .expect("Database died!")
        .is_some()
    {
        bot.send_html(
            message.chat.id,
            "There already is an open committee vote on this user.",
            message.id,
        )
        .await?;
        return Ok(());
    }

    let record = BanAllRecord::new(action, target, sender.id, reason);
    let record_id = db.add_record(&record).await.expect("Database died!");

    log::info!(
        "Committee member {} opened a network-wide {} vote on user {} (record #{})",
        sender.id,
        action,
        target,
        record_id
    );

    let status = bot
        .send_message(message.chat.id, record.produce_status_message(None))
        .parse_mode(teloxide::types::ParseMode::Html)
        .reply_markup(vote_keyboard(record_id))
        .await?;

    db.set_status_message(
        record_id,
        StatusHandle {
            chat_id: status.chat.id,
            message_id: status.id,
        },
    )
    .await
    .expect("Database died!");

    Ok(())
}

async fn handle_progress(
    bot: &Bot,
    message: &Message,
    jobman: &BotJobman,
) -> Result<(), RequestError> {
    let Some((target, _)) = resolve_target(message) else {
        bot.send_html(
            message.chat.id,
            "Whose? Reply to a message of the user, or give their numeric ID.",
            message.id,
        )
        .await?;
        return Ok(());
    };

    let response = match jobman
        .query_progress(target)
        .await
        .expect("Database died!")
    {
        Some((progress, completed)) => format!(
            "{} of {} chats processed ({} failed, {} skipped){}",
            progress.processed,
            progress.total_targets,
            progress.failed,
            progress.ignored,
            if completed { ". Done." } else { "." }
        ),
        None => "No network-wide action has ever run against this user.".to_string(),
    };

    bot.send_html(message.chat.id, &response, message.id).await?;
    Ok(())
}

/// Keeps the roster truthful when the bot is added to or removed from
/// a chat, so fan-outs don't enumerate chats we're no longer in.
pub async fn handle_my_chat_member(
    update: ChatMemberUpdated,
    db: Arc<Database>,
) -> Result<(), RequestError> {
    if update.chat.is_private() {
        return Ok(());
    }

    let present = update.new_chat_member.is_present();
    db.upsert_chat(update.chat.id, update.chat.title(), present)
        .await
        .expect("Database died!");

    log::info!(
        "Chat {} ({:?}) is now {}",
        update.chat.id,
        update.chat.title(),
        if present { "guarded" } else { "gone" }
    );

    Ok(())
}
