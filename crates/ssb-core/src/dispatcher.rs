use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, warn};

use crate::{
    audit::{AuditEvent, AuditLogger},
    auth::{is_allowed_user, AuthResult, AuthThrottle, Authenticator},
    command::{parse_message, CommandRequest, Inbound},
    config::{BusyPolicy, Config},
    domain::{ChatId, UserId},
    errors::Error,
    executor::Executor,
    messaging::{InboundMessage, ReplySink},
    policy::{CommandPolicy, Decision},
    session::SessionStore,
};

const WELCOME: &str = "Welcome to Secure Shell Bot!\n\
Please authenticate using /auth &lt;password&gt;\n\n\
Tips:\n\
1. Type commands directly: ls -la\n\
2. Or prefix with /: /ls -la\n\
3. For logs: tail -f /path/to/log\n\
4. Send /stop to stop a running command";

const HELP: &str = "Usage examples:\n\
- List files: ls -la\n\
- Monitor log: tail -f /var/log/syslog\n\
- Disk space: df -h\n\
- Process list: ps aux\n\n\
You can also prefix commands with / if you prefer: /ls -la\n\
Send /stop to stop a running command.";

const NOT_AUTHENTICATED: &str = "Please authenticate first using /auth &lt;password&gt;";

/// Per-identity execution locks for the Queue busy policy.
#[derive(Default)]
pub struct UserLocks {
    inner: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub async fn lock_user(&self, user_id: UserId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(user_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Message-handling entry point.
///
/// Routes each inbound message through identity gate → parsing →
/// (authentication flow | command policy → executor) and turns every
/// rejection into a user-visible reply. Per identity the machine is
/// `Unauthenticated → Authenticated → (Executing ⇄ Authenticated)`; it lives
/// as long as the process and holds no state across restarts.
pub struct Dispatcher {
    allowed_users: HashSet<i64>,
    busy_policy: BusyPolicy,
    store: SessionStore,
    authenticator: Authenticator,
    throttle: Mutex<AuthThrottle>,
    policy: CommandPolicy,
    executor: Executor,
    audit: AuditLogger,
    locks: UserLocks,
}

impl Dispatcher {
    pub fn new(cfg: &Config) -> Self {
        Self {
            allowed_users: cfg.allowed_users.clone(),
            busy_policy: cfg.busy_policy,
            store: SessionStore::new(cfg.session_timeout),
            authenticator: Authenticator::new(cfg.bot_password.clone()),
            throttle: Mutex::new(AuthThrottle::new(
                cfg.auth_rate_limit_enabled,
                cfg.auth_rate_limit_attempts,
                cfg.auth_rate_limit_window,
            )),
            policy: CommandPolicy::new(cfg.allowed_commands.clone(), cfg.shell_commands.clone()),
            executor: Executor::new(cfg.message_chunk_limit, cfg.stream_flush_interval),
            audit: AuditLogger::new(cfg.audit_log_path.clone(), cfg.audit_log_json),
            locks: UserLocks::default(),
        }
    }

    pub async fn is_executing(&self, user_id: UserId) -> bool {
        self.executor.is_running(user_id).await
    }

    pub async fn handle_message(&self, msg: &InboundMessage, sink: &dyn ReplySink) {
        let user = msg.user_id;
        let chat = msg.chat_id;
        let username = msg.username.as_deref();

        // Identity gate first. The rejection is generic and identical for
        // every message so an outsider learns nothing from probing.
        if !is_allowed_user(Some(user), &self.allowed_users) {
            self.record(AuditEvent::unauthorized_access(user.0, username));
            self.reply(sink, chat, "Unauthorized access denied.").await;
            return;
        }

        self.store.touch(user);

        match parse_message(&msg.text) {
            Inbound::Start => self.reply(sink, chat, WELCOME).await,
            Inbound::Help => {
                if self.store.is_authenticated(user) {
                    self.reply(sink, chat, HELP).await;
                } else {
                    self.reply(sink, chat, NOT_AUTHENTICATED).await;
                }
            }
            Inbound::Auth(secret) => {
                self.handle_auth(user, chat, username, secret, sink).await;
            }
            Inbound::Stop => self.handle_stop(user, chat, sink).await,
            Inbound::Command(req) => {
                self.handle_command(user, chat, username, req, sink).await;
            }
            Inbound::Empty => {
                self.reply(sink, chat, "Send a command to run, or /help for usage.")
                    .await;
            }
        }
    }

    async fn handle_auth(
        &self,
        user: UserId,
        chat: ChatId,
        username: Option<&str>,
        secret: Option<String>,
        sink: &dyn ReplySink,
    ) {
        let Some(secret) = secret else {
            self.reply(sink, chat, "Usage: /auth &lt;password&gt;").await;
            return;
        };

        let (allowed, retry_after) = self.throttle.lock().await.check(user);
        if !allowed {
            let secs = retry_after.map(|d| d.as_secs().max(1)).unwrap_or(1);
            self.reply(sink, chat, &format!("Too many attempts. Try again in {secs}s."))
                .await;
            return;
        }

        match self.authenticator.try_authenticate(&secret) {
            AuthResult::Success => {
                self.store.set_authenticated(user, true);
                self.record(AuditEvent::auth_attempt(user.0, username, true));
                self.reply(
                    sink,
                    chat,
                    "Authentication successful! You can now run commands directly.",
                )
                .await;
            }
            AuthResult::WrongSecret => {
                self.store.set_authenticated(user, false);
                self.record(AuditEvent::auth_attempt(user.0, username, false));
                self.reply(sink, chat, "Invalid password.").await;
            }
        }
    }

    async fn handle_stop(&self, user: UserId, chat: ChatId, sink: &dyn ReplySink) {
        if !self.store.is_authenticated(user) {
            self.reply(sink, chat, NOT_AUTHENTICATED).await;
            return;
        }

        // Keyed by the sender, so only the owning identity can cancel.
        if self.executor.cancel(user).await {
            self.reply(sink, chat, "Stopping command...").await;
        } else {
            self.reply(sink, chat, "No command is running.").await;
        }
    }

    async fn handle_command(
        &self,
        user: UserId,
        chat: ChatId,
        username: Option<&str>,
        req: CommandRequest,
        sink: &dyn ReplySink,
    ) {
        let authenticated = self.store.is_authenticated(user);

        match self.policy.authorize(authenticated, &req.argv) {
            Decision::Deny(reason) => {
                self.record(AuditEvent::command_denied(user.0, username, &req.raw, &reason));
                if authenticated {
                    self.reply(sink, chat, &format!("❌ {reason}")).await;
                } else {
                    self.reply(sink, chat, NOT_AUTHENTICATED).await;
                }
            }
            Decision::Allow { shell } => {
                self.record(AuditEvent::command(user.0, username, &req.raw));

                // Queue policy serializes this identity's commands; the lock
                // holder is the only runner, so the executor slot is free by
                // the time we acquire it. Other identities are unaffected.
                let _guard = match self.busy_policy {
                    BusyPolicy::Queue => Some(self.locks.lock_user(user).await),
                    BusyPolicy::Reject => None,
                };

                match self.executor.run(user, chat, &req, shell, sink).await {
                    Ok(()) => {}
                    Err(Error::Busy) => {
                        self.reply(
                            sink,
                            chat,
                            "⏳ A command is already running. Send /stop to cancel it.",
                        )
                        .await;
                    }
                    Err(Error::Spawn(e)) => {
                        self.reply(sink, chat, &format!("Error executing command: {e}"))
                            .await;
                    }
                    Err(e) => {
                        error!("command execution failed for user {}: {e}", user.0);
                        self.reply(sink, chat, "Error executing command.").await;
                    }
                }
            }
        }
    }

    async fn reply(&self, sink: &dyn ReplySink, chat: ChatId, text: &str) {
        // Best-effort delivery; failures are logged, never retried.
        if let Err(e) = sink.send_text(chat, text).await {
            warn!("reply delivery failed: {e}");
        }
    }

    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.audit.write(event) {
            warn!("audit write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct FakeSink {
        sent: StdMutex<Vec<(ChatId, String)>>,
    }

    impl FakeSink {
        fn texts_for(&self, chat: ChatId) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, _)| *c == chat)
                .map(|(_, t)| t.clone())
                .collect()
        }

        fn all(&self) -> Vec<(ChatId, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReplySink for FakeSink {
        async fn send_text(&self, chat_id: ChatId, html: &str) -> Result<()> {
            self.sent.lock().unwrap().push((chat_id, html.to_string()));
            Ok(())
        }
    }

    fn test_config() -> Config {
        let allowed: HashSet<String> = ["echo", "sleep", "sh", "true"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Config {
            telegram_bot_token: "x".to_string(),
            allowed_users: [1, 2].into_iter().collect(),
            bot_password: "hunter2".to_string(),
            allowed_commands: allowed,
            shell_commands: HashSet::new(),
            busy_policy: BusyPolicy::Reject,
            session_timeout: None,
            message_chunk_limit: 4000,
            stream_flush_interval: Duration::from_millis(50),
            auth_rate_limit_enabled: false,
            auth_rate_limit_attempts: 5,
            auth_rate_limit_window: Duration::from_secs(60),
            audit_log_path: format!(
                "/tmp/ssb-dispatch-test-{}-{:?}.log",
                std::process::id(),
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos()
            )
            .into(),
            audit_log_json: false,
        }
    }

    fn msg(user: i64, chat: i64, text: &str) -> InboundMessage {
        InboundMessage {
            user_id: UserId(user),
            chat_id: ChatId(chat),
            username: None,
            text: text.to_string(),
        }
    }

    async fn authenticate(d: &Dispatcher, sink: &FakeSink, user: i64, chat: i64) {
        d.handle_message(&msg(user, chat, "/auth hunter2"), sink).await;
    }

    #[tokio::test]
    async fn unknown_identity_gets_the_same_generic_rejection_for_anything() {
        let d = Dispatcher::new(&test_config());
        let sink = FakeSink::default();

        d.handle_message(&msg(99, 99, "/start"), &sink).await;
        d.handle_message(&msg(99, 99, "/auth hunter2"), &sink).await;
        d.handle_message(&msg(99, 99, "echo hi"), &sink).await;

        let texts = sink.texts_for(ChatId(99));
        assert_eq!(texts.len(), 3);
        assert!(texts.iter().all(|t| t == "Unauthorized access denied."));
    }

    #[tokio::test]
    async fn wrong_secret_never_authenticates() {
        let d = Dispatcher::new(&test_config());
        let sink = FakeSink::default();

        d.handle_message(&msg(1, 1, "/auth wrong"), &sink).await;
        assert!(sink.texts_for(ChatId(1)).last().unwrap().contains("Invalid password"));

        d.handle_message(&msg(1, 1, "echo hi"), &sink).await;
        let texts = sink.texts_for(ChatId(1));
        assert!(texts.last().unwrap().contains("authenticate first"));
    }

    #[tokio::test]
    async fn correct_secret_then_allowed_command_runs_to_exit_status() {
        let d = Dispatcher::new(&test_config());
        let sink = FakeSink::default();

        authenticate(&d, &sink, 1, 1).await;
        assert!(sink
            .texts_for(ChatId(1))
            .last()
            .unwrap()
            .contains("Authentication successful"));

        d.handle_message(&msg(1, 1, "echo hi"), &sink).await;
        let texts = sink.texts_for(ChatId(1));
        let n = texts.len();
        assert_eq!(texts[n - 2], "<pre>hi</pre>");
        assert!(texts[n - 1].contains("exit code 0"));
    }

    #[tokio::test]
    async fn marker_prefixed_command_works_the_same() {
        let d = Dispatcher::new(&test_config());
        let sink = FakeSink::default();

        authenticate(&d, &sink, 1, 1).await;
        d.handle_message(&msg(1, 1, "/echo hi"), &sink).await;
        assert!(sink.texts_for(ChatId(1)).iter().any(|t| t == "<pre>hi</pre>"));
    }

    #[tokio::test]
    async fn disallowed_executable_is_denied_even_when_authenticated() {
        let d = Dispatcher::new(&test_config());
        let sink = FakeSink::default();

        authenticate(&d, &sink, 1, 1).await;
        d.handle_message(&msg(1, 1, "rm -rf /"), &sink).await;
        assert!(sink
            .texts_for(ChatId(1))
            .last()
            .unwrap()
            .contains("command not allowed: rm"));
    }

    #[tokio::test]
    async fn busy_reject_and_owner_cancellation() {
        let d = Arc::new(Dispatcher::new(&test_config()));
        let sink = Arc::new(FakeSink::default());

        authenticate(&d, &sink, 1, 1).await;

        let d2 = d.clone();
        let sink2 = sink.clone();
        let handle =
            tokio::spawn(async move { d2.handle_message(&msg(1, 1, "sleep 30"), sink2.as_ref()).await });

        let started = Instant::now();
        while !d.is_executing(UserId(1)).await {
            assert!(started.elapsed() < Duration::from_secs(5));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Second command from the same identity: busy, no second process.
        d.handle_message(&msg(1, 1, "echo hi"), sink.as_ref()).await;
        assert!(sink
            .texts_for(ChatId(1))
            .last()
            .unwrap()
            .contains("already running"));

        // Stop from a different identity does not touch this run.
        authenticate(&d, &sink, 2, 2).await;
        d.handle_message(&msg(2, 2, "/stop"), sink.as_ref()).await;
        assert!(sink
            .texts_for(ChatId(2))
            .last()
            .unwrap()
            .contains("No command is running"));
        assert!(d.is_executing(UserId(1)).await);

        // Owner stop terminates the child promptly.
        d.handle_message(&msg(1, 1, "/stop"), sink.as_ref()).await;
        let begun = Instant::now();
        handle.await.unwrap();
        assert!(begun.elapsed() < Duration::from_secs(5));
        assert!(!d.is_executing(UserId(1)).await);
        assert!(sink.texts_for(ChatId(1)).iter().any(|t| t.contains("stopped")));
    }

    #[tokio::test]
    async fn identities_never_see_each_others_output() {
        let d = Arc::new(Dispatcher::new(&test_config()));
        let sink = Arc::new(FakeSink::default());

        authenticate(&d, &sink, 1, 1).await;
        authenticate(&d, &sink, 2, 2).await;

        let d1 = d.clone();
        let s1 = sink.clone();
        let h1 = tokio::spawn(async move {
            d1.handle_message(&msg(1, 1, "echo from-one"), s1.as_ref()).await
        });
        let d2 = d.clone();
        let s2 = sink.clone();
        let h2 = tokio::spawn(async move {
            d2.handle_message(&msg(2, 2, "echo from-two"), s2.as_ref()).await
        });
        h1.await.unwrap();
        h2.await.unwrap();

        for (chat, text) in sink.all() {
            match chat {
                ChatId(1) => assert!(!text.contains("from-two")),
                ChatId(2) => assert!(!text.contains("from-one")),
                other => panic!("unexpected chat {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn one_slow_identity_does_not_block_another() {
        let d = Arc::new(Dispatcher::new(&test_config()));
        let sink = Arc::new(FakeSink::default());

        authenticate(&d, &sink, 1, 1).await;
        authenticate(&d, &sink, 2, 2).await;

        let d1 = d.clone();
        let s1 = sink.clone();
        let slow =
            tokio::spawn(async move { d1.handle_message(&msg(1, 1, "sleep 30"), s1.as_ref()).await });

        let started = Instant::now();
        while !d.is_executing(UserId(1)).await {
            assert!(started.elapsed() < Duration::from_secs(5));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        d.handle_message(&msg(2, 2, "echo quick"), sink.as_ref()).await;
        assert!(sink.texts_for(ChatId(2)).iter().any(|t| t == "<pre>quick</pre>"));

        d.handle_message(&msg(1, 1, "/stop"), sink.as_ref()).await;
        slow.await.unwrap();
    }

    #[tokio::test]
    async fn queue_policy_runs_both_commands_without_busy() {
        let mut cfg = test_config();
        cfg.busy_policy = BusyPolicy::Queue;
        let d = Arc::new(Dispatcher::new(&cfg));
        let sink = Arc::new(FakeSink::default());

        authenticate(&d, &sink, 1, 1).await;

        let d1 = d.clone();
        let s1 = sink.clone();
        let h1 = tokio::spawn(async move {
            d1.handle_message(&msg(1, 1, "echo first"), s1.as_ref()).await
        });
        let d2 = d.clone();
        let s2 = sink.clone();
        let h2 = tokio::spawn(async move {
            d2.handle_message(&msg(1, 1, "echo second"), s2.as_ref()).await
        });
        h1.await.unwrap();
        h2.await.unwrap();

        let texts = sink.texts_for(ChatId(1));
        assert!(texts.iter().any(|t| t == "<pre>first</pre>"));
        assert!(texts.iter().any(|t| t == "<pre>second</pre>"));
        assert!(!texts.iter().any(|t| t.contains("already running")));
    }

    #[tokio::test]
    async fn auth_throttle_limits_attempts_when_enabled() {
        let mut cfg = test_config();
        cfg.auth_rate_limit_enabled = true;
        cfg.auth_rate_limit_attempts = 2;
        let d = Dispatcher::new(&cfg);
        let sink = FakeSink::default();

        d.handle_message(&msg(1, 1, "/auth nope"), &sink).await;
        d.handle_message(&msg(1, 1, "/auth nope"), &sink).await;
        d.handle_message(&msg(1, 1, "/auth hunter2"), &sink).await;

        let texts = sink.texts_for(ChatId(1));
        assert!(texts.last().unwrap().contains("Too many attempts"));
        // The throttled attempt never authenticated.
        d.handle_message(&msg(1, 1, "echo hi"), &sink).await;
        assert!(sink
            .texts_for(ChatId(1))
            .last()
            .unwrap()
            .contains("authenticate first"));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_not_fatal() {
        let mut cfg = test_config();
        cfg.allowed_commands.insert("missing-binary-xyz".to_string());
        let d = Dispatcher::new(&cfg);
        let sink = FakeSink::default();

        authenticate(&d, &sink, 1, 1).await;
        d.handle_message(&msg(1, 1, "missing-binary-xyz"), &sink).await;
        assert!(sink
            .texts_for(ChatId(1))
            .last()
            .unwrap()
            .contains("Error executing command"));

        // The dispatcher is still serving.
        d.handle_message(&msg(1, 1, "echo still-alive"), &sink).await;
        assert!(sink.texts_for(ChatId(1)).iter().any(|t| t == "<pre>still-alive</pre>"));
    }

    #[tokio::test]
    async fn unrecognized_input_gets_a_help_style_reply() {
        let d = Dispatcher::new(&test_config());
        let sink = FakeSink::default();

        d.handle_message(&msg(1, 1, "   "), &sink).await;
        assert!(sink.texts_for(ChatId(1)).last().unwrap().contains("/help"));
    }

    #[tokio::test]
    async fn start_and_help_replies() {
        let d = Dispatcher::new(&test_config());
        let sink = FakeSink::default();

        d.handle_message(&msg(1, 1, "/start"), &sink).await;
        assert!(sink.texts_for(ChatId(1)).last().unwrap().contains("Secure Shell Bot"));

        // Help is gated on authentication.
        d.handle_message(&msg(1, 1, "/help"), &sink).await;
        assert!(sink
            .texts_for(ChatId(1))
            .last()
            .unwrap()
            .contains("authenticate first"));

        authenticate(&d, &sink, 1, 1).await;
        d.handle_message(&msg(1, 1, "/help"), &sink).await;
        assert!(sink.texts_for(ChatId(1)).last().unwrap().contains("Usage examples"));
    }

    #[tokio::test]
    async fn session_expiry_requires_reauthentication() {
        let mut cfg = test_config();
        cfg.session_timeout = Some(Duration::from_millis(50));
        let d = Dispatcher::new(&cfg);
        let sink = FakeSink::default();

        authenticate(&d, &sink, 1, 1).await;
        tokio::time::sleep(Duration::from_millis(120)).await;

        d.handle_message(&msg(1, 1, "echo hi"), &sink).await;
        assert!(sink
            .texts_for(ChatId(1))
            .last()
            .unwrap()
            .contains("authenticate first"));
    }
}
