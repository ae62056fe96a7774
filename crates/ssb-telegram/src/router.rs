use std::sync::Arc;

use teloxide::{dispatching::Dispatcher as TgDispatcher, dptree, prelude::*};
use tracing::info;

use ssb_core::{
    config::Config,
    dispatcher::Dispatcher,
    domain::{ChatId, UserId},
    messaging::{InboundMessage, ReplySink},
};

use crate::TelegramMessenger;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
    pub sink: Arc<dyn ReplySink>,
}

/// Long-poll Telegram and feed every text message into the core dispatcher.
///
/// teloxide handles updates concurrently, so one identity's long-running
/// command never blocks another identity's messages; the core serializes
/// per identity itself.
pub async fn run_polling(cfg: Arc<Config>, dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    if let Ok(me) = bot.get_me().await {
        info!("ssb started: @{}", me.username());
    }
    info!("allowed users: {}", cfg.allowed_users.len());
    info!("allowed commands: {}", cfg.allowed_commands.len());

    let sink: Arc<dyn ReplySink> = Arc::new(TelegramMessenger::new(bot.clone()));
    let state = Arc::new(AppState {
        cfg,
        dispatcher,
        sink,
    });

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handle_message));

    TgDispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    // Only text updates carry commands; everything else is ignored.
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(user) = msg.from() else {
        return Ok(());
    };

    let inbound = InboundMessage {
        user_id: UserId(user.id.0 as i64),
        chat_id: ChatId(msg.chat.id.0),
        username: user.username.clone(),
        text: text.to_string(),
    };

    state
        .dispatcher
        .handle_message(&inbound, state.sink.as_ref())
        .await;

    Ok(())
}
