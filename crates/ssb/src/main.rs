use std::sync::Arc;

use ssb_core::{config::Config, dispatcher::Dispatcher};

#[tokio::main]
async fn main() -> Result<(), ssb_core::Error> {
    ssb_core::logging::init("ssb");

    let cfg = Arc::new(Config::load()?);
    let dispatcher = Arc::new(Dispatcher::new(&cfg));

    ssb_telegram::router::run_polling(cfg, dispatcher)
        .await
        .map_err(|e| ssb_core::Error::Transport(format!("telegram bot failed: {e}")))?;

    Ok(())
}
