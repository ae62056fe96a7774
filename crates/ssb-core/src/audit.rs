use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::Utc;
use serde::Serialize;

use crate::Result;

const AUDIT_MAX_TEXT: usize = 500;

/// RFC3339 timestamp in UTC.
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorized: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn base(event: &str, user_id: i64, username: Option<&str>) -> Self {
        Self {
            timestamp: iso_timestamp_utc(),
            event: event.to_string(),
            user_id: Some(user_id),
            username: username.map(|s| s.to_string()),
            command: None,
            authorized: None,
            reason: None,
        }
    }

    pub fn unauthorized_access(user_id: i64, username: Option<&str>) -> Self {
        Self::base("unauthorized_access", user_id, username)
    }

    pub fn auth_attempt(user_id: i64, username: Option<&str>, authorized: bool) -> Self {
        let mut ev = Self::base("auth", user_id, username);
        ev.authorized = Some(authorized);
        ev
    }

    pub fn command(user_id: i64, username: Option<&str>, command: &str) -> Self {
        let mut ev = Self::base("command", user_id, username);
        ev.command = Some(command.to_string());
        ev
    }

    pub fn command_denied(
        user_id: i64,
        username: Option<&str>,
        command: &str,
        reason: &str,
    ) -> Self {
        let mut ev = Self::base("command_denied", user_id, username);
        ev.command = Some(command.to_string());
        ev.reason = Some(reason.to_string());
        ev
    }
}

/// Append-only execution log (the `command_log.txt` of the original bot).
///
/// Plain lines by default; JSON lines when configured. Write failures are the
/// caller's problem to log, never to retry.
#[derive(Clone, Debug)]
pub struct AuditLogger {
    path: PathBuf,
    json: bool,
}

impl AuditLogger {
    pub fn new(path: impl Into<PathBuf>, json: bool) -> Self {
        Self {
            path: path.into(),
            json,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, mut event: AuditEvent) -> Result<()> {
        if let Some(s) = &event.command {
            event.command = Some(truncate_text(s, AUDIT_MAX_TEXT));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        if self.json {
            let line = serde_json::to_string(&event)?;
            writeln!(file, "{line}")?;
            return Ok(());
        }

        let user = event
            .username
            .as_deref()
            .unwrap_or("unknown")
            .to_string();
        let mut line = format!(
            "[{}] {} user {} ({})",
            event.timestamp,
            event.event,
            event.user_id.unwrap_or_default(),
            user
        );
        if let Some(cmd) = &event.command {
            line.push_str(&format!(": {cmd}"));
        }
        if let Some(reason) = &event.reason {
            line.push_str(&format!(" [{reason}]"));
        }
        if let Some(ok) = event.authorized {
            line.push_str(if ok { " [ok]" } else { " [failed]" });
        }
        writeln!(file, "{line}")?;
        Ok(())
    }
}

fn truncate_text(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    format!("{}...", s.chars().take(max_len).collect::<String>())
}
