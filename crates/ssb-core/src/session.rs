use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::domain::UserId;

/// Per-identity authentication state. Held only in process memory; a restart
/// logs everyone out.
#[derive(Clone, Copy, Debug)]
pub struct Session {
    pub authenticated: bool,
    pub last_activity: Instant,
}

/// Owns every `Session` for the process lifetime.
///
/// Backed by a sharded map so one identity's update never contends with
/// another's; sessions are created lazily on first access and never removed,
/// only logically expired after the configured inactivity window.
pub struct SessionStore {
    sessions: DashMap<UserId, Session>,
    timeout: Option<Duration>,
}

impl SessionStore {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            sessions: DashMap::new(),
            timeout,
        }
    }

    /// Snapshot of the identity's session, creating a fresh unauthenticated
    /// one on first access. Applies inactivity expiry when configured.
    pub fn get(&self, user_id: UserId) -> Session {
        self.get_at(user_id, Instant::now())
    }

    pub fn get_at(&self, user_id: UserId, now: Instant) -> Session {
        let mut entry = self.sessions.entry(user_id).or_insert(Session {
            authenticated: false,
            last_activity: now,
        });
        self.expire_if_stale(&mut entry, now);
        *entry
    }

    pub fn is_authenticated(&self, user_id: UserId) -> bool {
        self.get(user_id).authenticated
    }

    pub fn set_authenticated(&self, user_id: UserId, authenticated: bool) {
        self.set_authenticated_at(user_id, authenticated, Instant::now())
    }

    pub fn set_authenticated_at(&self, user_id: UserId, authenticated: bool, now: Instant) {
        let mut entry = self.sessions.entry(user_id).or_insert(Session {
            authenticated: false,
            last_activity: now,
        });
        entry.authenticated = authenticated;
        entry.last_activity = now;
    }

    /// Refresh `last_activity`; creates the session if needed. A session that
    /// already sat past the inactivity window expires before the refresh, so
    /// touching cannot revive it.
    pub fn touch(&self, user_id: UserId) {
        self.touch_at(user_id, Instant::now())
    }

    pub fn touch_at(&self, user_id: UserId, now: Instant) {
        let mut entry = self.sessions.entry(user_id).or_insert(Session {
            authenticated: false,
            last_activity: now,
        });
        self.expire_if_stale(&mut entry, now);
        entry.last_activity = now;
    }

    fn expire_if_stale(&self, session: &mut Session, now: Instant) {
        if let Some(timeout) = self.timeout {
            if session.authenticated && now.duration_since(session.last_activity) > timeout {
                session.authenticated = false;
            }
        }
    }
}
