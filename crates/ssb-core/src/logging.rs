use tracing_subscriber::{fmt, EnvFilter};

/// Initialize logging/tracing for the bot.
pub fn init(service_name: &str) {
    // Default: info for our crates, warn for everything else.
    // Can be overridden with `RUST_LOG`.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,ssb=info,ssb_core=info,ssb_telegram=info,{service_name}=info"))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .init();
}
