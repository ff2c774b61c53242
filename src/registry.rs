use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::auth::Principal;
use crate::config::SessionConfig;
use crate::message::ServerEvent;
use crate::metrics;

/// Why a session was closed by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PolicyViolation,
    IdleTimeout,
    CredentialExpired,
    Disconnect,
}

impl CloseReason {
    pub fn code(&self) -> &'static str {
        match self {
            CloseReason::PolicyViolation => "POLICY_VIOLATION",
            CloseReason::IdleTimeout => "IDLE_TIMEOUT",
            CloseReason::CredentialExpired => "CREDENTIAL_EXPIRED",
            CloseReason::Disconnect => "DISCONNECT",
        }
    }
}

pub struct Session {
    pub principal: String,
    pub roles: Vec<String>,
    pub subscriptions: HashSet<String>,
    pub last_activity: Instant,
    pub opened_at: Instant,
    /// Unix seconds; sessions with a lapsed credential are closed by the sweep
    pub credential_expires_at: Option<i64>,
    handle: mpsc::UnboundedSender<ServerEvent>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, Session>,
    /// Derived index; a session id appears in exactly one principal's set
    by_principal: HashMap<String, HashSet<String>>,
}

/// Tracks live connections and enforces the per-principal session cap.
///
/// All state lives behind one mutex so evict-then-insert for a principal is
/// atomic with respect to concurrent registrations and the sweep task.
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    max_sessions_per_principal: usize,
}

impl SessionRegistry {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            max_sessions_per_principal: config.max_sessions_per_principal,
        }
    }

    /// Register a session for an authenticated principal.
    ///
    /// When the principal is at the session cap, the oldest session by last
    /// activity is closed with a policy-violation status first. A failed
    /// close is logged and never blocks the new registration.
    pub async fn register(
        &self,
        session_id: &str,
        principal: &Principal,
        handle: mpsc::UnboundedSender<ServerEvent>,
    ) {
        let mut inner = self.inner.lock().await;

        while self.count_locked(&inner, &principal.name) >= self.max_sessions_per_principal {
            let oldest = inner
                .by_principal
                .get(&principal.name)
                .into_iter()
                .flatten()
                .min_by_key(|id| inner.sessions.get(*id).map(|s| s.last_activity))
                .cloned();

            match oldest {
                Some(id) => {
                    tracing::info!(
                        principal = %principal.name,
                        evicted_session = %id,
                        "Session cap reached, evicting oldest session"
                    );
                    metrics::SESSIONS_EVICTED_TOTAL.inc();
                    Self::close_locked(&mut inner, &id, CloseReason::PolicyViolation);
                }
                None => break,
            }
        }

        let now = Instant::now();
        inner.sessions.insert(
            session_id.to_string(),
            Session {
                principal: principal.name.clone(),
                roles: principal.roles.clone(),
                subscriptions: HashSet::new(),
                last_activity: now,
                opened_at: now,
                credential_expires_at: Some(principal.token_expires_at),
                handle,
            },
        );
        inner
            .by_principal
            .entry(principal.name.clone())
            .or_default()
            .insert(session_id.to_string());

        tracing::info!(session_id = %session_id, principal = %principal.name, "Session registered");
    }

    /// Update last activity; no-op for unknown sessions
    pub async fn touch(&self, session_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.last_activity = Instant::now();
        }
    }

    /// Record an authorizer-approved subscription. Returns false when the
    /// session is not registered.
    pub async fn subscribe(&self, session_id: &str, destination: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.sessions.get_mut(session_id) {
            Some(session) => {
                session.subscriptions.insert(destination.to_string());
                true
            }
            None => false,
        }
    }

    /// Delete a session and its index entry; no-op if absent
    pub async fn remove(&self, session_id: &str) {
        let mut inner = self.inner.lock().await;
        Self::remove_locked(&mut inner, session_id);
    }

    /// Best-effort transport close, always followed by removal
    pub async fn close(&self, session_id: &str, reason: CloseReason) {
        let mut inner = self.inner.lock().await;
        Self::close_locked(&mut inner, session_id, reason);
    }

    /// Close and remove every session idle longer than `idle_timeout` or
    /// whose bearer credential has expired. Runs on a dedicated timer.
    pub async fn sweep_idle(&self, now: Instant, idle_timeout: std::time::Duration) {
        let now_unix = chrono::Utc::now().timestamp();
        let mut inner = self.inner.lock().await;

        let stale: Vec<(String, CloseReason)> = inner
            .sessions
            .iter()
            .filter_map(|(id, session)| {
                if now.duration_since(session.last_activity) > idle_timeout {
                    Some((id.clone(), CloseReason::IdleTimeout))
                } else if session
                    .credential_expires_at
                    .map(|exp| exp <= now_unix)
                    .unwrap_or(false)
                {
                    Some((id.clone(), CloseReason::CredentialExpired))
                } else {
                    None
                }
            })
            .collect();

        for (id, reason) in stale {
            tracing::info!(session_id = %id, reason = %reason.code(), "Sweeping session");
            Self::close_locked(&mut inner, &id, reason);
        }
    }

    pub async fn count_sessions(&self, principal: &str) -> usize {
        let inner = self.inner.lock().await;
        self.count_locked(&inner, principal)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.inner.lock().await.sessions.contains_key(session_id)
    }

    /// Transport handles of sessions subscribed to `destination`
    pub async fn subscribers_of(
        &self,
        destination: &str,
    ) -> Vec<(String, mpsc::UnboundedSender<ServerEvent>)> {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .iter()
            .filter(|(_, s)| s.subscriptions.contains(destination))
            .map(|(id, s)| (id.clone(), s.handle.clone()))
            .collect()
    }

    /// Transport handles of every session owned by `principal`
    pub async fn sessions_of_principal(
        &self,
        principal: &str,
    ) -> Vec<(String, mpsc::UnboundedSender<ServerEvent>)> {
        let inner = self.inner.lock().await;
        inner
            .by_principal
            .get(principal)
            .into_iter()
            .flatten()
            .filter_map(|id| {
                inner
                    .sessions
                    .get(id)
                    .map(|s| (id.clone(), s.handle.clone()))
            })
            .collect()
    }

    fn count_locked(&self, inner: &RegistryInner, principal: &str) -> usize {
        inner
            .by_principal
            .get(principal)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    fn close_locked(inner: &mut RegistryInner, session_id: &str, reason: CloseReason) {
        if let Some(session) = inner.sessions.get(session_id) {
            let close = ServerEvent::Close {
                code: reason.code().to_string(),
                reason: match reason {
                    CloseReason::PolicyViolation => "session limit exceeded".to_string(),
                    CloseReason::IdleTimeout => "session idle timeout".to_string(),
                    CloseReason::CredentialExpired => "credential expired".to_string(),
                    CloseReason::Disconnect => "disconnected".to_string(),
                },
            };
            if let Err(e) = session.handle.send(close) {
                // Cleanup must not be blocked by a failed close
                tracing::warn!(session_id = %session_id, error = %e, "Failed to close session transport");
            }
        }
        Self::remove_locked(inner, session_id);
    }

    fn remove_locked(inner: &mut RegistryInner, session_id: &str) {
        if let Some(session) = inner.sessions.remove(session_id) {
            if let Some(ids) = inner.by_principal.get_mut(&session.principal) {
                ids.remove(session_id);
                if ids.is_empty() {
                    inner.by_principal.remove(&session.principal);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry(cap: usize) -> SessionRegistry {
        SessionRegistry::new(&SessionConfig {
            max_sessions_per_principal: cap,
            idle_timeout_secs: 1800,
            sweep_interval_secs: 60,
        })
    }

    fn principal(name: &str) -> Principal {
        Principal {
            name: name.to_string(),
            roles: vec![],
            token_expires_at: chrono::Utc::now().timestamp() + 3600,
        }
    }

    fn channel() -> (
        mpsc::UnboundedSender<ServerEvent>,
        mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test(start_paused = true)]
    async fn session_cap_is_never_exceeded() {
        let registry = registry(5);
        let alice = principal("alice");

        for i in 0..8 {
            let (tx, _rx) = channel();
            registry.register(&format!("s{}", i), &alice, tx).await;
            tokio::time::advance(Duration::from_secs(1)).await;
            assert!(registry.count_sessions("alice").await <= 5);
        }
        assert_eq!(registry.count_sessions("alice").await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_session_evicts_oldest_with_policy_violation() {
        let registry = registry(5);
        let alice = principal("alice");

        let mut receivers = Vec::new();
        for i in 0..5 {
            let (tx, rx) = channel();
            registry.register(&format!("s{}", i), &alice, tx).await;
            receivers.push(rx);
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        // s1 is now the oldest by activity
        registry.touch("s0").await;

        let (tx, _rx) = channel();
        registry.register("s5", &alice, tx).await;

        assert!(!registry.contains("s1").await);
        assert!(registry.contains("s0").await);
        assert!(registry.contains("s5").await);

        let close = receivers[1].recv().await.unwrap();
        match close {
            ServerEvent::Close { code, .. } => assert_eq!(code, "POLICY_VIOLATION"),
            other => panic!("expected close event, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_failure_still_records_new_session() {
        let registry = registry(1);
        let alice = principal("alice");

        let (tx, rx) = channel();
        drop(rx); // transport already gone, close will fail
        registry.register("old", &alice, tx).await;

        let (tx2, _rx2) = channel();
        registry.register("new", &alice, tx2).await;

        assert!(registry.contains("new").await);
        assert!(!registry.contains("old").await);
        assert_eq!(registry.count_sessions("alice").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_sessions_past_the_timeout() {
        let registry = registry(5);
        let timeout = Duration::from_secs(30 * 60);

        let (tx, _rx_idle) = channel();
        registry.register("idle", &principal("alice"), tx).await;

        tokio::time::advance(Duration::from_secs(20 * 60)).await;
        let (tx, _rx_fresh) = channel();
        registry.register("fresh", &principal("bob"), tx).await;

        // idle: 25min, fresh: 5min -> neither sweepable yet
        tokio::time::advance(Duration::from_secs(5 * 60)).await;
        registry.sweep_idle(Instant::now(), timeout).await;
        assert!(registry.contains("idle").await);
        assert!(registry.contains("fresh").await);

        // idle: 31min, fresh: 11min
        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        registry.sweep_idle(Instant::now(), timeout).await;
        assert!(!registry.contains("idle").await);
        assert!(registry.contains("fresh").await);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_closes_sessions_with_expired_credentials() {
        let registry = registry(5);
        let mut expired = principal("alice");
        expired.token_expires_at = chrono::Utc::now().timestamp() - 10;

        let (tx, mut rx) = channel();
        registry.register("s1", &expired, tx).await;

        registry
            .sweep_idle(Instant::now(), Duration::from_secs(1800))
            .await;
        assert!(!registry.contains("s1").await);
        match rx.recv().await.unwrap() {
            ServerEvent::Close { code, .. } => assert_eq!(code, "CREDENTIAL_EXPIRED"),
            other => panic!("expected close event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_cleans_the_index() {
        let registry = registry(5);
        let (tx, _rx) = channel();
        registry.register("s1", &principal("alice"), tx).await;

        registry.remove("s1").await;
        registry.remove("s1").await;
        assert_eq!(registry.count_sessions("alice").await, 0);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn subscriptions_feed_fanout_lookup() {
        let registry = registry(5);
        let (tx, _rx) = channel();
        registry.register("s1", &principal("alice"), tx).await;
        assert!(registry.subscribe("s1", "/topic/public/general").await);
        assert!(!registry.subscribe("ghost", "/topic/public/general").await);

        let subs = registry.subscribers_of("/topic/public/general").await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].0, "s1");
        assert!(registry.subscribers_of("/topic/public/other").await.is_empty());

        let mine = registry.sessions_of_principal("alice").await;
        assert_eq!(mine.len(), 1);
    }
}
