use teloxide::{
    payloads::EditMessageTextSetters,
    prelude::Requester,
    types::{ChatId, ParseMode, UserId},
    ApiError, Bot, RequestError,
};

use super::{ActionKind, ActionOutcome, ActionRunner, StatusHandle, StatusSink};

/// Applies bans and unbans through the Bot API. Both calls are
/// idempotent on Telegram's side, so the worker pool may retry freely.
pub struct TelegramActions {
    bot: Bot,
}

impl TelegramActions {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

impl ActionRunner for TelegramActions {
    async fn apply_action(
        &self,
        chat: ChatId,
        user: UserId,
        action: ActionKind,
    ) -> Result<ActionOutcome, RequestError> {
        let result = match action {
            ActionKind::Ban => self.bot.ban_chat_member(chat, user).await.map(|_| ()),
            ActionKind::Unban => self.bot.unban_chat_member(chat, user).await.map(|_| ()),
        };

        match result {
            Ok(()) => Ok(ActionOutcome::Applied),
            // Chats we can't act in anymore, or where there's nothing
            // to act on, are skipped rather than failed; retrying them
            // won't change anything.
            Err(RequestError::Api(
                ApiError::ChatNotFound
                | ApiError::UserNotFound
                | ApiError::BotKicked
                | ApiError::BotKickedFromSupergroup
                | ApiError::NotEnoughRightsToRestrict
                | ApiError::CantRestrictSelf,
            )) => Ok(ActionOutcome::Ignored),
            Err(e) => Err(e),
        }
    }
}

/// Pushes rendered status texts into the posted status message.
pub struct TelegramStatus {
    bot: Bot,
}

impl TelegramStatus {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

impl StatusSink for TelegramStatus {
    async fn update_status(&self, handle: StatusHandle, text: &str) -> Result<(), RequestError> {
        let result = self
            .bot
            .edit_message_text(handle.chat_id, handle.message_id, text)
            .parse_mode(ParseMode::Html)
            .await;

        // A throttled renderer can legitimately produce the same text
        // twice in a row; telegram rejects the no-op edit.
        if let Err(RequestError::Api(ApiError::MessageNotModified)) = result {
            return Ok(());
        }

        result.map(|_| ())
    }
}
