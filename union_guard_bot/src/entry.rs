use std::{fs, sync::Arc};

use teloxide::{dptree::deps, prelude::*};

use crate::{
    banall::{
        jobman::{database::Database, Jobman},
        telegram::{TelegramActions, TelegramStatus},
    },
    handlers,
};

/// # Panics
///
/// Panics if there's no key file, or the database won't open.
pub async fn entry() {
    let key = fs::read_to_string(match cfg!(debug_assertions) {
        true => "key_debug",
        false => "key",
    })
    .expect("Could not load bot key file!");

    let bot = Bot::new(key);

    bot.set_my_commands(handlers::generate_bot_commands())
        .await
        .expect("Failed to set bot commands!");

    let db = Arc::new(Database::new().await.expect("Could not init the database!"));

    let queued = db
        .count_queued_jobs()
        .await
        .expect("Could not init the database!");
    if queued > 0 {
        log::info!("Resuming {} queued child jobs from the previous run", queued);
    }

    let jobman = Jobman::new(
        db.clone(),
        TelegramActions::new(bot.clone()),
        TelegramStatus::new(bot.clone()),
    )
    .await;

    log::info!("Creating the handler...");

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handlers::handle_message))
        .branch(Update::filter_callback_query().endpoint(handlers::votes::handle_callback_query))
        .branch(Update::filter_my_chat_member().endpoint(handlers::handle_my_chat_member));

    log::info!("Dispatching the dispatcher!");

    Dispatcher::builder(bot, handler)
        .default_handler(|_| async {})
        .dependencies(deps![db, jobman])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    log::info!("it appears we have been bonked.");
}
