/// Core error type.
///
/// Adapter crates should map their specific errors into this type so the bot
/// core can handle failures consistently. No variant here may take down the
/// dispatcher for other identities; everything except `Config` is recoverable
/// and turns into a user-facing reply or a log line.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("a command is already running")]
    Busy,

    #[error("failed to start command: {0}")]
    Spawn(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, Error>;
