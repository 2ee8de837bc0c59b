//! The hub — the only place sessions are created, mutated, evicted,
//! and the only place forwarding decisions are made.
//!
//! Locking discipline: session-table shard locks are held only for
//! lookup/insert/remove, never while touching a connection; per-session
//! locks never span I/O. Counters are atomics.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;

use pairlink_core::envelope::Envelope;
use pairlink_core::token::{generate_token, redact};
use pairlink_core::types::{code, msg, AuthPayload, ErrorPayload, StatusPayload};
use pairlink_core::Role;

use crate::quota::QuotaGate;
use crate::ratelimit::MAX_MESSAGE_SIZE;
use crate::session::{Connection, Session};
use crate::store::{Store, StoreError, TokenInfo};

/// How long a session with no connections stays in memory.
pub const IDLE_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// How often the reaper scans for idle sessions.
pub const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
    #[error("invalid role: {0}")]
    InvalidRole(String),
    #[error("malformed auth payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Pairing and forwarding authority. All public operations are safe
/// under parallel invocation.
pub struct Hub {
    sessions: DashMap<String, Arc<Session>>,
    store: Arc<dyn Store>,
    quota: QuotaGate,
    conn_count: AtomicI64,
    started_at: Instant,
}

impl Hub {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            sessions: DashMap::new(),
            quota: QuotaGate::new(store.clone()),
            store,
            conn_count: AtomicI64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn connection_count(&self) -> i64 {
        self.conn_count.load(Ordering::Relaxed)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Admit a freshly upgraded connection carrying an `auth` envelope.
    ///
    /// On success the connection is bound to its role, installed in the
    /// session's slot (deposing any same-role incumbent), and counted.
    pub fn authenticate(
        &self,
        conn: &Arc<Connection>,
        env: &Envelope,
    ) -> Result<Arc<Session>, AuthError> {
        let auth: AuthPayload = env.parse_payload()?;

        if !self.store.token_exists(&auth.token)? {
            return Err(AuthError::InvalidToken);
        }

        let role = Role::parse(&auth.role).ok_or_else(|| AuthError::InvalidRole(auth.role.clone()))?;
        conn.bind(role);

        // Table lock: lookup-or-insert only, released before slot work.
        let session = self
            .sessions
            .entry(auth.token.clone())
            .or_insert_with(|| Arc::new(Session::new(auth.token.clone())))
            .clone();

        // Overwrite first, then tell the incumbent to go away — the peer
        // never sees an offline gap. The deposed driver must not be
        // awaited here.
        if let Some(deposed) = session.install(role, conn.clone()) {
            deposed.done.cancel();
            tracing::info!(token = %redact(&auth.token), %role, "same-role takeover");
        }

        self.conn_count.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            token = %redact(&auth.token),
            %role,
            paired = session.is_paired(),
            "authenticated"
        );

        Ok(session)
    }

    /// Tear down a connection's membership. Idempotent per connection;
    /// a deposed twin's disconnect leaves the usurper's slot alone.
    pub fn disconnect(&self, session: &Arc<Session>, conn: &Arc<Connection>) {
        let Some(role) = conn.role() else { return };
        if !conn.begin_departure() {
            return;
        }

        let cleared = session.clear_if(role, conn);
        self.conn_count.fetch_sub(1, Ordering::Relaxed);

        if cleared {
            if let Some(peer) = session.peer_of(role) {
                self.notify_status(&peer, "offline");
            }
        }

        tracing::info!(token = %redact(&session.token), %role, "disconnected");
    }

    /// The hot path: deliver one raw frame from `sender` to its peer.
    ///
    /// Every denial is reported to the sender only, via a `chat.error`
    /// envelope; the connection always survives.
    pub fn forward(&self, session: &Arc<Session>, sender: &Arc<Connection>, raw: &str) {
        if raw.len() > MAX_MESSAGE_SIZE {
            self.send_error(sender, code::MESSAGE_TOO_LARGE, "Message exceeds 5MiB limit", 0);
            return;
        }

        if !sender.allow() {
            self.send_error(sender, code::RATE_LIMITED, "Rate limit exceeded", 1000);
            return;
        }

        if let Some(breach) = self.quota.check(&session.token) {
            self.send_error(sender, breach, "Bandwidth quota exceeded", 60_000);
            return;
        }

        let Some(role) = sender.role() else { return };
        let Some(peer) = session.peer_of(role) else {
            self.send_error(sender, code::PEER_OFFLINE, "Peer is not connected", 0);
            return;
        };

        let size = raw.len() as u64;
        if peer.try_send(raw.to_string()) {
            // Account only after the frame is accepted into the queue.
            sender.bytes_sent.fetch_add(size, Ordering::Relaxed);
            peer.bytes_recv.fetch_add(size, Ordering::Relaxed);
            if let Err(e) = self.quota.record(&session.token, size as i64) {
                tracing::warn!(error = %e, "bandwidth record failed");
            }
        } else {
            self.send_error(sender, code::PEER_OFFLINE, "Peer send buffer full", 1000);
        }
    }

    /// Build a `chat.error` envelope and enqueue it non-blockingly.
    fn send_error(&self, conn: &Arc<Connection>, code: &str, message: &str, retry_ms: i64) {
        let env = match Envelope::new(
            msg::CHAT_ERROR,
            ErrorPayload {
                code: code.to_string(),
                message: message.to_string(),
                retry_after_ms: retry_ms,
            },
        ) {
            Ok(env) => env,
            Err(e) => {
                tracing::error!(error = %e, "failed to build error envelope");
                return;
            }
        };
        match env.encode() {
            Ok(raw) => {
                conn.try_send(raw);
            }
            Err(e) => tracing::error!(error = %e, "failed to encode error envelope"),
        }
    }

    fn notify_status(&self, conn: &Arc<Connection>, peer_state: &str) {
        let env = match Envelope::new(
            msg::STATUS,
            StatusPayload {
                peer: peer_state.to_string(),
            },
        ) {
            Ok(env) => env,
            Err(e) => {
                tracing::error!(error = %e, "failed to build status envelope");
                return;
            }
        };
        if let Ok(raw) = env.encode() {
            conn.try_send(raw);
        }
    }

    // ── Admin surface ─────────────────────────────────────────────────────────

    pub fn create_token(&self) -> Result<String, StoreError> {
        let token = generate_token();
        self.store.create_token(&token)?;
        tracing::info!(token = %redact(&token), "token created");
        Ok(token)
    }

    /// Revoke a token: evict the in-memory session, closing both
    /// members, then delete from the store (cascading the ledger).
    pub fn delete_token(&self, token: &str) -> Result<(), StoreError> {
        if let Some((_, session)) = self.sessions.remove(token) {
            let (phone, agent) = session.members();
            if let Some(c) = phone {
                c.done.cancel();
            }
            if let Some(c) = agent {
                c.done.cancel();
            }
        }
        tracing::info!(token = %redact(token), "token deleted");
        self.store.delete_token(token)
    }

    /// (phone online, agent online)
    pub fn token_status(&self, token: &str) -> (bool, bool) {
        match self.sessions.get(token) {
            Some(session) => session.occupancy(),
            None => (false, false),
        }
    }

    pub fn list_tokens(&self) -> Result<Vec<TokenInfo>, StoreError> {
        self.store.list_tokens()
    }

    /// Daily ledger usage, fail-open (None on store trouble).
    pub fn daily_usage(&self, token: &str) -> Option<i64> {
        self.quota.daily_usage(token)
    }

    /// Drop sessions whose both slots are empty past the idle window.
    /// Returns the number removed.
    pub fn sweep_idle_sessions(&self) -> usize {
        self.sweep_idle(IDLE_SESSION_TIMEOUT)
    }

    fn sweep_idle(&self, timeout: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_idle(timeout));
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            tracing::info!(removed, remaining = self.sessions.len(), "idle sessions swept");
        }
        removed
    }
}

/// Periodic idle-session sweep, shutdown-aware.
pub async fn idle_reaper(hub: Arc<Hub>, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(IDLE_SWEEP_INTERVAL);
    interval.tick().await; // fires immediately; skip the first
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("idle reaper shutting down");
                return;
            }
            _ = interval.tick() => {
                hub.sweep_idle_sessions();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::DAILY_QUOTA_BYTES;
    use crate::session::OUTBOUND_QUEUE_DEPTH;
    use crate::store::SqliteStore;
    use tokio::sync::mpsc;

    fn hub() -> Arc<Hub> {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        Arc::new(Hub::new(store))
    }

    fn auth_env(token: &str, role: &str) -> Envelope {
        Envelope::new(
            msg::AUTH,
            AuthPayload {
                token: token.to_string(),
                role: role.to_string(),
            },
        )
        .unwrap()
    }

    fn connect(
        hub: &Hub,
        token: &str,
        role: &str,
    ) -> (Arc<Connection>, mpsc::Receiver<String>, Arc<Session>) {
        let (conn, rx) = Connection::new();
        let session = hub.authenticate(&conn, &auth_env(token, role)).unwrap();
        (conn, rx, session)
    }

    fn recv_error(rx: &mut mpsc::Receiver<String>) -> ErrorPayload {
        let raw = rx.try_recv().expect("expected an error envelope");
        let env = Envelope::decode(&raw).unwrap();
        assert_eq!(env.kind, msg::CHAT_ERROR);
        env.parse_payload().unwrap()
    }

    #[test]
    fn new_hub_is_empty() {
        let h = hub();
        assert_eq!(h.connection_count(), 0);
        assert_eq!(h.session_count(), 0);
    }

    #[test]
    fn create_and_delete_token() {
        let h = hub();
        let token = h.create_token().unwrap();
        assert!(token.starts_with("pl_pair_"));
        assert!(h.store.token_exists(&token).unwrap());

        h.delete_token(&token).unwrap();
        assert!(!h.store.token_exists(&token).unwrap());

        // Deleting again is a no-op.
        h.delete_token(&token).unwrap();
    }

    #[test]
    fn authenticate_rejects_unknown_token() {
        let h = hub();
        let (conn, _rx) = Connection::new();
        let err = h.authenticate(&conn, &auth_env("bogus", "phone")).unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
        assert_eq!(h.connection_count(), 0);
    }

    #[test]
    fn authenticate_rejects_unknown_role() {
        let h = hub();
        let token = h.create_token().unwrap();
        let (conn, _rx) = Connection::new();
        let err = h.authenticate(&conn, &auth_env(&token, "hacker")).unwrap_err();
        match err {
            AuthError::InvalidRole(role) => assert_eq!(role, "hacker"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn authenticate_binds_and_counts() {
        let h = hub();
        let token = h.create_token().unwrap();
        let (conn, _rx, session) = connect(&h, &token, "phone");

        assert_eq!(session.token, token);
        assert_eq!(conn.role(), Some(Role::Phone));
        assert_eq!(h.connection_count(), 1);
        assert_eq!(h.session_count(), 1);
        assert!(!session.is_paired());

        let (_agent, _arx, session2) = connect(&h, &token, "agent");
        assert!(Arc::ptr_eq(&session, &session2));
        assert!(session.is_paired());
        assert_eq!(h.connection_count(), 2);
        assert_eq!(h.session_count(), 1);
    }

    #[test]
    fn disconnect_decrements_exactly_once() {
        let h = hub();
        let token = h.create_token().unwrap();
        let (conn, _rx, session) = connect(&h, &token, "phone");

        h.disconnect(&session, &conn);
        assert_eq!(h.connection_count(), 0);
        assert!(session.occupant(Role::Phone).is_none());

        // Repeat disconnects are no-ops.
        h.disconnect(&session, &conn);
        assert_eq!(h.connection_count(), 0);
    }

    #[test]
    fn disconnect_notifies_remaining_peer() {
        let h = hub();
        let token = h.create_token().unwrap();
        let (_phone, mut phone_rx, session) = connect(&h, &token, "phone");
        let (agent, _agent_rx, _) = connect(&h, &token, "agent");

        h.disconnect(&session, &agent);

        let raw = phone_rx.try_recv().unwrap();
        let env = Envelope::decode(&raw).unwrap();
        assert_eq!(env.kind, msg::STATUS);
        let status: StatusPayload = env.parse_payload().unwrap();
        assert_eq!(status.peer, "offline");
    }

    #[test]
    fn takeover_deposes_incumbent_without_offline_blip() {
        let h = hub();
        let token = h.create_token().unwrap();
        let (_phone, mut phone_rx, session) = connect(&h, &token, "phone");
        let (agent1, _a1rx, _) = connect(&h, &token, "agent");

        let (agent2, _a2rx, _) = connect(&h, &token, "agent");
        assert!(agent1.done.is_cancelled());
        assert!(!agent2.done.is_cancelled());
        assert_eq!(h.connection_count(), 3);

        let current = session.occupant(Role::Agent).unwrap();
        assert!(Arc::ptr_eq(&current, &agent2));

        // The deposed agent's disconnect must not clear the new slot and
        // must not emit a status to the phone.
        h.disconnect(&session, &agent1);
        assert_eq!(h.connection_count(), 2);
        let current = session.occupant(Role::Agent).unwrap();
        assert!(Arc::ptr_eq(&current, &agent2));
        assert!(phone_rx.try_recv().is_err(), "phone saw a spurious status");
    }

    #[test]
    fn forward_delivers_byte_identical_and_accounts() {
        use std::sync::atomic::Ordering;

        let h = hub();
        let token = h.create_token().unwrap();
        let (phone, _prx, session) = connect(&h, &token, "phone");
        let (_agent, mut agent_rx, _) = connect(&h, &token, "agent");

        let frame = format!(
            r#"{{"v":1,"type":"chat.send","id":"f","ts":1,"payload":{{"text":"{}"}}}}"#,
            "x".repeat(36)
        );
        assert_eq!(frame.len(), 100);

        h.forward(&session, &phone, &frame);

        assert_eq!(agent_rx.try_recv().unwrap(), frame);
        assert_eq!(phone.bytes_sent.load(Ordering::Relaxed), 100);
        let agent = session.occupant(Role::Agent).unwrap();
        assert_eq!(agent.bytes_recv.load(Ordering::Relaxed), 100);
        assert_eq!(h.daily_usage(&token), Some(100));
    }

    #[test]
    fn forward_preserves_order() {
        let h = hub();
        let token = h.create_token().unwrap();
        let (phone, _prx, session) = connect(&h, &token, "phone");
        let (_agent, mut agent_rx, _) = connect(&h, &token, "agent");

        let frames: Vec<String> = (0..5)
            .map(|i| format!(r#"{{"v":1,"type":"chat.send","id":"{i}","ts":1,"payload":null}}"#))
            .collect();
        for f in &frames {
            h.forward(&session, &phone, f);
        }
        for f in &frames {
            assert_eq!(&agent_rx.try_recv().unwrap(), f);
        }
    }

    #[test]
    fn forward_without_peer_reports_offline() {
        use std::sync::atomic::Ordering;

        let h = hub();
        let token = h.create_token().unwrap();
        let (phone, mut phone_rx, session) = connect(&h, &token, "phone");

        h.forward(&session, &phone, "frame");

        let err = recv_error(&mut phone_rx);
        assert_eq!(err.code, code::PEER_OFFLINE);
        assert_eq!(err.retry_after_ms, 0);
        assert_eq!(phone.bytes_sent.load(Ordering::Relaxed), 0);
        assert_eq!(h.daily_usage(&token), Some(0));
    }

    #[test]
    fn forward_rejects_oversize_frame() {
        let h = hub();
        let token = h.create_token().unwrap();
        let (phone, mut phone_rx, session) = connect(&h, &token, "phone");
        let (_agent, mut agent_rx, _) = connect(&h, &token, "agent");

        let big = "x".repeat(MAX_MESSAGE_SIZE + 1);
        h.forward(&session, &phone, &big);

        let err = recv_error(&mut phone_rx);
        assert_eq!(err.code, code::MESSAGE_TOO_LARGE);
        assert_eq!(err.retry_after_ms, 0);
        assert!(agent_rx.try_recv().is_err());
        assert_eq!(h.daily_usage(&token), Some(0));
    }

    #[test]
    fn thirty_first_frame_is_rate_limited() {
        let h = hub();
        let token = h.create_token().unwrap();
        let (phone, mut phone_rx, session) = connect(&h, &token, "phone");
        let (_agent, mut agent_rx, _) = connect(&h, &token, "agent");

        for _ in 0..31 {
            h.forward(&session, &phone, "frame");
        }

        let mut delivered = 0;
        while agent_rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 30);

        let err = recv_error(&mut phone_rx);
        assert_eq!(err.code, code::RATE_LIMITED);
        assert_eq!(err.retry_after_ms, 1000);
    }

    #[test]
    fn quota_breach_reports_with_long_retry() {
        let h = hub();
        let token = h.create_token().unwrap();
        h.store.record_bytes(&token, DAILY_QUOTA_BYTES).unwrap();

        let (phone, mut phone_rx, session) = connect(&h, &token, "phone");
        let (_agent, mut agent_rx, _) = connect(&h, &token, "agent");

        h.forward(&session, &phone, "frame");

        let err = recv_error(&mut phone_rx);
        assert_eq!(err.code, code::DAILY_QUOTA_EXCEEDED);
        assert_eq!(err.retry_after_ms, 60_000);
        assert!(agent_rx.try_recv().is_err());
    }

    #[test]
    fn full_peer_queue_reports_offline_without_accounting() {
        use std::sync::atomic::Ordering;

        let h = hub();
        let token = h.create_token().unwrap();
        let (phone, _phone_rx, session) = connect(&h, &token, "phone");
        let (agent, mut agent_rx, _) = connect(&h, &token, "agent");

        // Jam the phone's queue; nothing drains it.
        for _ in 0..OUTBOUND_QUEUE_DEPTH {
            assert!(phone.try_send("pad".into()));
        }

        h.forward(&session, &agent, "f");

        // The overflow frame is not accounted; the error lands on the
        // agent's own queue.
        assert_eq!(agent.bytes_sent.load(Ordering::Relaxed), 0);
        assert_eq!(h.daily_usage(&token), Some(0));
        let err = recv_error(&mut agent_rx);
        assert_eq!(err.code, code::PEER_OFFLINE);
        assert_eq!(err.retry_after_ms, 1000);
    }

    #[test]
    fn token_status_tracks_occupancy() {
        let h = hub();
        let token = h.create_token().unwrap();
        assert_eq!(h.token_status(&token), (false, false));

        let (_phone, _prx, session) = connect(&h, &token, "phone");
        assert_eq!(h.token_status(&token), (true, false));

        let (agent, _arx, _) = connect(&h, &token, "agent");
        assert_eq!(h.token_status(&token), (true, true));

        h.disconnect(&session, &agent);
        assert_eq!(h.token_status(&token), (true, false));
    }

    #[test]
    fn delete_token_evicts_session_and_closes_members() {
        let h = hub();
        let token = h.create_token().unwrap();
        let (phone, _prx, _) = connect(&h, &token, "phone");
        let (agent, _arx, _) = connect(&h, &token, "agent");

        h.delete_token(&token).unwrap();

        assert!(phone.done.is_cancelled());
        assert!(agent.done.is_cancelled());
        assert_eq!(h.session_count(), 0);
        assert!(!h.store.token_exists(&token).unwrap());
    }

    #[test]
    fn sweep_removes_only_stale_empty_sessions() {
        let h = hub();

        // Emptied a while before the sweep: stale.
        let stale = Arc::new(Session::new("stale"));
        let (conn, _rx1) = Connection::new();
        stale.install(Role::Phone, conn.clone());
        stale.clear_if(Role::Phone, &conn);
        h.sessions.insert("stale".to_string(), stale);

        // Occupied slot pins the session regardless of age.
        let occupied = Arc::new(Session::new("occupied"));
        let (conn, _rx2) = Connection::new();
        occupied.install(Role::Phone, conn);
        h.sessions.insert("occupied".to_string(), occupied);

        // Never carried traffic: counts as idle.
        h.sessions
            .insert("untouched".to_string(), Arc::new(Session::new("untouched")));

        std::thread::sleep(Duration::from_millis(50));

        // Emptied just now: inside the window.
        let fresh = Arc::new(Session::new("fresh"));
        let (conn, _rx3) = Connection::new();
        fresh.install(Role::Phone, conn.clone());
        fresh.clear_if(Role::Phone, &conn);
        h.sessions.insert("fresh".to_string(), fresh);

        assert_eq!(h.sweep_idle(Duration::from_millis(30)), 2);
        assert!(h.sessions.contains_key("fresh"));
        assert!(h.sessions.contains_key("occupied"));
        assert!(!h.sessions.contains_key("stale"));
        assert!(!h.sessions.contains_key("untouched"));
    }

    #[test]
    fn concurrent_auth_keeps_one_connection_per_role() {
        let h = hub();
        let token = h.create_token().unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let h = h.clone();
            let token = token.clone();
            handles.push(std::thread::spawn(move || {
                let role = if i % 2 == 0 { "agent" } else { "phone" };
                let (conn, _rx) = Connection::new();
                h.authenticate(&conn, &auth_env(&token, role)).unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(h.connection_count(), 10);
        assert_eq!(h.session_count(), 1);
        let session = h.sessions.get(&token).unwrap().clone();
        assert_eq!(session.occupancy(), (true, true));
    }
}
