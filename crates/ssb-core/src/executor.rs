use std::{collections::HashMap, process::Stdio, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    command::CommandRequest,
    domain::{ChatId, UserId},
    errors::Error,
    formatting::{code_block, escape_html, escaped_len, split_escaped_chunks},
    messaging::ReplySink,
    Result,
};

/// Spawns approved commands and streams their output to the reply sink.
///
/// At most one live child process per identity: `run` registers the identity
/// in the run table before spawning and a second command finds the slot
/// occupied. Output is captured line by line from both pipes and coalesced
/// into transport-sized chunks, flushed either when full or on a timer so a
/// long-running `tail -f` keeps producing replies. A final reply reporting
/// the exit status (or cancellation) is always sent after the last chunk.
pub struct Executor {
    runs: Mutex<HashMap<UserId, CancellationToken>>,
    chunk_limit: usize,
    flush_interval: Duration,
}

impl Executor {
    pub fn new(chunk_limit: usize, flush_interval: Duration) -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            chunk_limit: chunk_limit.max(1),
            // tokio's interval panics on a zero period.
            flush_interval: flush_interval.max(Duration::from_millis(1)),
        }
    }

    pub async fn is_running(&self, user_id: UserId) -> bool {
        self.runs.lock().await.contains_key(&user_id)
    }

    /// Request cancellation of the identity's running command. No-op (false)
    /// when nothing is running; the run loop kills and reaps the child.
    pub async fn cancel(&self, user_id: UserId) -> bool {
        let runs = self.runs.lock().await;
        match runs.get(&user_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run one approved command for `user_id`, streaming output to `sink`.
    ///
    /// Returns `Err(Error::Busy)` when a command is already running for this
    /// identity and `Err(Error::Spawn)` when the process cannot start; both
    /// leave the dispatcher free to keep serving other identities.
    pub async fn run(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        req: &CommandRequest,
        shell: bool,
        sink: &dyn ReplySink,
    ) -> Result<()> {
        let token = self.begin(user_id).await?;
        let result = self.stream_child(chat_id, req, shell, sink, &token).await;
        self.finish(user_id).await;
        result
    }

    async fn begin(&self, user_id: UserId) -> Result<CancellationToken> {
        let mut runs = self.runs.lock().await;
        if runs.contains_key(&user_id) {
            return Err(Error::Busy);
        }
        let token = CancellationToken::new();
        runs.insert(user_id, token.clone());
        Ok(token)
    }

    async fn finish(&self, user_id: UserId) {
        self.runs.lock().await.remove(&user_id);
    }

    async fn stream_child(
        &self,
        chat_id: ChatId,
        req: &CommandRequest,
        shell: bool,
        sink: &dyn ReplySink,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut cmd = if shell {
            // Explicit per-executable opt-in only; see CommandPolicy.
            let mut c = Command::new("/bin/sh");
            c.arg("-c").arg(&req.raw);
            c
        } else {
            let Some((program, args)) = req.argv.split_first() else {
                return Err(Error::Spawn("empty command".to_string()));
            };
            let mut c = Command::new(program);
            c.args(args);
            c
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            Error::Spawn(format!("{}: {e}", req.argv.first().map(String::as_str).unwrap_or("?")))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Spawn("stderr was not captured".to_string()))?;

        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut out_done = false;
        let mut err_done = false;

        let mut pending = String::new();
        let mut sent_any = false;
        let mut flush = tokio::time::interval(self.flush_interval);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let cancelled = loop {
            if out_done && err_done {
                break false;
            }
            tokio::select! {
                _ = token.cancelled() => {
                    break true;
                }
                line = out_lines.next_line(), if !out_done => {
                    match line {
                        Ok(Some(l)) => {
                            self.push_line(chat_id, sink, &mut pending, &mut sent_any, &l).await;
                        }
                        Ok(None) => out_done = true,
                        Err(e) => {
                            warn!("stdout read failed: {e}");
                            out_done = true;
                        }
                    }
                }
                line = err_lines.next_line(), if !err_done => {
                    match line {
                        Ok(Some(l)) => {
                            self.push_line(chat_id, sink, &mut pending, &mut sent_any, &l).await;
                        }
                        Ok(None) => err_done = true,
                        Err(e) => {
                            warn!("stderr read failed: {e}");
                            err_done = true;
                        }
                    }
                }
                _ = flush.tick() => {
                    self.flush(chat_id, sink, &mut pending, &mut sent_any).await;
                }
            }
        };

        if cancelled {
            // Stop forwarding: buffered output is dropped, not sent.
            pending.clear();
            if let Err(e) = child.kill().await {
                warn!("failed to kill child process: {e}");
            }
            let _ = child.wait().await;
            self.send_reply(chat_id, sink, "🛑 Command stopped.").await;
            return Ok(());
        }

        // Both pipes hit EOF; flush the tail before reporting the status so
        // every chunk precedes the exit reply.
        self.flush(chat_id, sink, &mut pending, &mut sent_any).await;
        let status = child.wait().await?;

        let final_text = if status.success() && !sent_any {
            "✅ Command executed successfully (no output)".to_string()
        } else if status.success() {
            "✅ Completed (exit code 0)".to_string()
        } else {
            format!("⚠️ Command failed ({status})")
        };
        self.send_reply(chat_id, sink, &final_text).await;

        Ok(())
    }

    async fn push_line(
        &self,
        chat_id: ChatId,
        sink: &dyn ReplySink,
        pending: &mut String,
        sent_any: &mut bool,
        line: &str,
    ) {
        // Sized on the escaped form, so entity inflation cannot push a chunk
        // past the transport limit.
        let line_len = escaped_len(line);

        // Oversized single line: ship it in pieces on its own.
        if line_len >= self.chunk_limit {
            self.flush(chat_id, sink, pending, sent_any).await;
            for piece in split_escaped_chunks(line, self.chunk_limit) {
                self.send_chunk(chat_id, sink, &piece, sent_any).await;
            }
            return;
        }

        if escaped_len(pending) + line_len + 1 > self.chunk_limit {
            self.flush(chat_id, sink, pending, sent_any).await;
        }
        if !pending.is_empty() {
            pending.push('\n');
        }
        pending.push_str(line);
    }

    async fn flush(
        &self,
        chat_id: ChatId,
        sink: &dyn ReplySink,
        pending: &mut String,
        sent_any: &mut bool,
    ) {
        if pending.is_empty() {
            return;
        }
        let text = std::mem::take(pending);
        self.send_chunk(chat_id, sink, &text, sent_any).await;
    }

    async fn send_chunk(
        &self,
        chat_id: ChatId,
        sink: &dyn ReplySink,
        text: &str,
        sent_any: &mut bool,
    ) {
        *sent_any = true;
        if let Err(e) = sink.send_text(chat_id, &code_block(&escape_html(text))).await {
            warn!("reply delivery failed: {e}");
        }
    }

    async fn send_reply(&self, chat_id: ChatId, sink: &dyn ReplySink, text: &str) {
        if let Err(e) = sink.send_text(chat_id, text).await {
            warn!("reply delivery failed: {e}");
        }
    }
}
