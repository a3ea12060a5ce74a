//! Boilerplate shared by the guard bot: logger bootstrap, retrying
//! message sending, and a couple of Telegram lookups.

use std::time::Duration;

use futures::Future;

use teloxide::{
    payloads::SendMessageSetters,
    prelude::*,
    sugar::request::RequestReplyExt,
    types::{Message, MessageId, Recipient},
    RequestError,
};

/// Initialize logging and start the `closure` in an async runtime.
/// Logging is enabled by default on level `info` unless overridden
/// by environment variable `RUST_LOG`. This uses the crate
/// [pretty_env_logger][] internally, see its documentation for more details.
///
/// [pretty_env_logger]: https://docs.rs/pretty_env_logger
pub fn start_everything(closure: impl Future<Output = ()>) {
    let log_level = std::env::var_os("RUST_LOG")
        .unwrap_or_else(|| std::ffi::OsString::from("info"))
        .into_string()
        .unwrap_or_else(|_| String::from("info"));

    // journald stamps lines on its own; don't double up on timestamps there.
    let running_as_systemd_service = std::env::var_os("JOURNAL_STREAM").is_some();

    let mut builder = match running_as_systemd_service {
        true => pretty_env_logger::formatted_builder(),
        false => pretty_env_logger::formatted_timed_builder(),
    };

    builder.parse_filters(&log_level);

    if builder.try_init().is_err() {
        log::error!("Tried to init logger twice!");
    }

    log::info!("hi");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(closure);
}

/// Find out if a user of this ID is an admin of the specified chat of that ID.
/// If so, returns the `ChatMember` object describing their permissions,
/// otherwise `None`.
pub async fn get_admin_of(
    bot: &Bot,
    user: UserId,
    chat: ChatId,
) -> Result<Option<teloxide::types::ChatMember>, RequestError> {
    Ok(bot
        .get_chat_administrators(chat)
        .await?
        .into_iter()
        .find(|x| x.user.id == user))
}

/// Retry a telegram request up to 3 times, sleeping out any
/// flood waits it runs into in between.
#[macro_export]
macro_rules! teloxide_retry {
    ($call:expr) => {{
        let mut attempt: u8 = 0;
        loop {
            let result = $call;
            attempt += 1;
            if attempt >= 3 || result.is_ok() {
                break result;
            }
            match &result {
                Err(::teloxide::RequestError::RetryAfter(secs)) => {
                    ::tokio::time::sleep(secs.duration()).await;
                }
                Err(_) => {
                    ::tokio::time::sleep(::std::time::Duration::from_secs(1)).await;
                }
                Ok(_) => unreachable!(),
            }
        }
    }};
}

/// Telegram rejects messages longer than this many characters.
const MESSAGE_LENGTH_LIMIT: usize = 4096;

/// Cut `text` down so telegram accepts it. Anything over the limit is
/// dropped; status messages this bot produces never get close anyway.
pub fn clamp_message_length(text: &str) -> &str {
    match text.char_indices().nth(MESSAGE_LENGTH_LIMIT) {
        Some((cutoff, _)) => &text[..cutoff],
        None => text,
    }
}

pub trait BotSendHtml {
    /// Opinionated method to send a message: HTML markup, length clamped,
    /// and retries on flood waits or other transient issues.
    fn send_html<'a>(
        &'a self,
        to_where: impl Into<Recipient> + Send,
        text: &'a str,
        reply_to: impl Into<Option<MessageId>> + Send,
    ) -> impl Future<Output = Result<Message, RequestError>> + Send;
}

impl BotSendHtml for Bot {
    async fn send_html<'a>(
        &'a self,
        to_where: impl Into<Recipient> + Send,
        text: &'a str,
        reply_to: impl Into<Option<MessageId>> + Send,
    ) -> Result<Message, RequestError> {
        let to_where: Recipient = to_where.into();
        let reply_to: Option<MessageId> = reply_to.into();
        let text = clamp_message_length(text);

        let mut attempt: u8 = 0;
        loop {
            let mut request = self
                .send_message(to_where.clone(), text)
                .parse_mode(teloxide::types::ParseMode::Html);
            if let Some(reply_to) = reply_to {
                request = request.reply_to(reply_to);
            }
            let result = request.await;
            attempt += 1;

            if result.is_ok() || attempt >= 3 {
                break result;
            }

            if let Err(RequestError::RetryAfter(secs)) = &result {
                tokio::time::sleep(secs.duration()).await;
            } else {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::clamp_message_length;

    #[test]
    fn short_text_untouched() {
        let text = "hi hello";
        assert_eq!(clamp_message_length(text), text);
    }

    #[test]
    fn long_text_clamped() {
        let text = "a".repeat(5000);
        assert_eq!(clamp_message_length(&text).len(), 4096);
    }

    #[test]
    fn clamp_respects_char_boundaries() {
        // 4095 ASCII characters followed by multibyte ones; the cut must
        // not land in the middle of a codepoint.
        let mut text = "a".repeat(4095);
        text.push_str("ééé");
        let clamped = clamp_message_length(&text);
        assert_eq!(clamped.chars().count(), 4096);
        assert!(clamped.ends_with('é'));
    }
}
