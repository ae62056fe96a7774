use std::{
    collections::HashSet,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Policy for a second command arriving while one is still running
/// for the same identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusyPolicy {
    /// Reply with a "busy" error and do not start a second process.
    Reject,
    /// Wait for the running command to finish, then run.
    Queue,
}

/// Typed configuration, loaded once at startup and treated as read-only.
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub telegram_bot_token: String,
    pub allowed_users: HashSet<i64>,
    pub bot_password: String,

    // Command policy
    pub allowed_commands: HashSet<String>,
    pub shell_commands: HashSet<String>,

    // Execution behavior
    pub busy_policy: BusyPolicy,
    pub session_timeout: Option<Duration>,
    pub message_chunk_limit: usize,
    pub stream_flush_interval: Duration,

    // Auth brute-force throttle (off by default)
    pub auth_rate_limit_enabled: bool,
    pub auth_rate_limit_attempts: u32,
    pub auth_rate_limit_window: Duration,

    // Audit
    pub audit_log_path: PathBuf,
    pub audit_log_json: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        // Required env vars; missing or empty values are fatal at startup.
        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let allowed_users: HashSet<i64> = parse_csv_i64(env_str("TELEGRAM_ALLOWED_USERS"))
            .into_iter()
            .collect();
        if allowed_users.is_empty() {
            return Err(Error::Config(
                "TELEGRAM_ALLOWED_USERS environment variable is required".to_string(),
            ));
        }

        let bot_password = env_str("BOT_PASSWORD").unwrap_or_default();
        if bot_password.trim().is_empty() {
            return Err(Error::Config(
                "BOT_PASSWORD environment variable is required".to_string(),
            ));
        }

        let allowed_commands: HashSet<String> =
            parse_csv(env_str("ALLOWED_COMMANDS")).into_iter().collect();
        if allowed_commands.is_empty() {
            return Err(Error::Config(
                "ALLOWED_COMMANDS environment variable is required".to_string(),
            ));
        }

        // Shell interpretation is a per-executable opt-in; entries that are
        // not also in ALLOWED_COMMANDS have no effect.
        let shell_commands: HashSet<String> =
            parse_csv(env_str("SHELL_COMMANDS")).into_iter().collect();

        let busy_policy = match env_str("BUSY_POLICY").as_deref() {
            Some("queue") => BusyPolicy::Queue,
            Some("reject") | None => BusyPolicy::Reject,
            Some(other) => {
                return Err(Error::Config(format!(
                    "BUSY_POLICY must be 'reject' or 'queue', got '{other}'"
                )))
            }
        };

        // 0 or unset disables session expiry.
        let session_timeout = env_u64("SESSION_TIMEOUT_SECS")
            .filter(|&s| s > 0)
            .map(Duration::from_secs);

        let message_chunk_limit = env_usize("MESSAGE_CHUNK_LIMIT").unwrap_or(4000);
        // 0 means unset; a zero flush period would panic the run loop.
        let stream_flush_interval = Duration::from_millis(
            env_u64("STREAM_FLUSH_MS").filter(|&ms| ms > 0).unwrap_or(500),
        );

        let auth_rate_limit_enabled = env_bool("AUTH_RATE_LIMIT_ENABLED").unwrap_or(false);
        let auth_rate_limit_attempts = env_u32("AUTH_RATE_LIMIT_ATTEMPTS").unwrap_or(5);
        let auth_rate_limit_window =
            Duration::from_secs(env_u64("AUTH_RATE_LIMIT_WINDOW").unwrap_or(60));

        let audit_log_path =
            PathBuf::from(env_str("AUDIT_LOG_PATH").unwrap_or("command_log.txt".to_string()));
        let audit_log_json = env_bool("AUDIT_LOG_JSON").unwrap_or(false);

        Ok(Self {
            telegram_bot_token,
            allowed_users,
            bot_password,
            allowed_commands,
            shell_commands,
            busy_policy,
            session_timeout,
            message_chunk_limit,
            stream_flush_interval,
            auth_rate_limit_enabled,
            auth_rate_limit_attempts,
            auth_rate_limit_window,
            audit_log_path,
            audit_log_json,
        })
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}
