//! Session and connection state — the in-memory half of pairing.
//!
//! A `Session` binds a pairing token to at most one connection per role.
//! A `Connection` is owned by its socket driver; the session only holds
//! `Arc` references into slots, so driver teardown and slot bookkeeping
//! stay independent.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pairlink_core::Role;

use crate::ratelimit::TokenBucket;

/// Outbound queue depth per connection. Overflow is drop-and-report
/// at the producer; frames already queued are never dropped.
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// A single client connection (phone or agent).
///
/// Role and rate limiter are unset until authentication succeeds and
/// are written exactly once. The writer task owns the receiving end of
/// `outbound`; `done` is the close-exactly-once termination signal.
#[derive(Debug)]
pub struct Connection {
    role: OnceLock<Role>,
    limiter: OnceLock<Mutex<TokenBucket>>,
    pub bytes_sent: AtomicU64,
    pub bytes_recv: AtomicU64,
    pub last_ping: Mutex<Instant>,
    outbound: mpsc::Sender<String>,
    pub done: CancellationToken,
    departed: AtomicBool,
}

impl Connection {
    /// Create a connection and hand the outbound receiver to the caller
    /// (the writer task is its sole consumer).
    pub fn new() -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let conn = Arc::new(Self {
            role: OnceLock::new(),
            limiter: OnceLock::new(),
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            last_ping: Mutex::new(Instant::now()),
            outbound: tx,
            done: CancellationToken::new(),
            departed: AtomicBool::new(false),
        });
        (conn, rx)
    }

    pub fn role(&self) -> Option<Role> {
        self.role.get().copied()
    }

    /// Bind role and rate limiter. Called once, at successful auth.
    pub fn bind(&self, role: Role) {
        let _ = self.role.set(role);
        let _ = self.limiter.set(Mutex::new(TokenBucket::for_role(role)));
    }

    /// Consume one rate-limit token. Connections that have not been
    /// authenticated yet carry no limiter and are allowed through.
    pub fn allow(&self) -> bool {
        match self.limiter.get() {
            Some(bucket) => bucket.lock().map(|mut b| b.allow()).unwrap_or(true),
            None => true,
        }
    }

    /// Non-blocking enqueue onto the outbound queue.
    /// Returns false when the queue is full or the writer is gone.
    pub fn try_send(&self, frame: String) -> bool {
        self.outbound.try_send(frame).is_ok()
    }

    pub fn touch_ping(&self) {
        if let Ok(mut t) = self.last_ping.lock() {
            *t = Instant::now();
        }
    }

    /// First caller wins; repeat disconnects of the same connection
    /// become no-ops.
    pub fn begin_departure(&self) -> bool {
        !self.departed.swap(true, Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct SessionState {
    phone: Option<Arc<Connection>>,
    agent: Option<Arc<Connection>>,
    last_active: Option<Instant>,
}

/// A pairing session: one token, two role slots, an idle timestamp.
///
/// All slot transitions happen under the session's own lock, which is
/// never held across I/O or across the session-table lock.
#[derive(Debug)]
pub struct Session {
    pub token: String,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            state: Mutex::new(SessionState {
                phone: None,
                agent: None,
                last_active: None,
            }),
        }
    }

    /// Install `conn` into its role slot, returning the deposed occupant
    /// if one was there. The slot is overwritten before the incumbent is
    /// told to go away, so the peer never observes an offline gap.
    pub fn install(&self, role: Role, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let mut state = self.state.lock().expect("session lock poisoned");
        state.last_active = Some(Instant::now());
        match role {
            Role::Phone => state.phone.replace(conn),
            Role::Agent => state.agent.replace(conn),
        }
    }

    /// Clear the role slot only if it still holds `conn`.
    ///
    /// A deposed connection races its own disconnect against the takeover
    /// that replaced it; the identity check makes the loser a no-op.
    pub fn clear_if(&self, role: Role, conn: &Arc<Connection>) -> bool {
        let mut state = self.state.lock().expect("session lock poisoned");
        let slot = match role {
            Role::Phone => &mut state.phone,
            Role::Agent => &mut state.agent,
        };
        match slot {
            Some(current) if Arc::ptr_eq(current, conn) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// The connection currently holding `role`'s slot.
    pub fn occupant(&self, role: Role) -> Option<Arc<Connection>> {
        let state = self.state.lock().expect("session lock poisoned");
        match role {
            Role::Phone => state.phone.clone(),
            Role::Agent => state.agent.clone(),
        }
    }

    /// The peer of `role` (phone ↔ agent).
    pub fn peer_of(&self, role: Role) -> Option<Arc<Connection>> {
        self.occupant(role.peer())
    }

    pub fn is_paired(&self) -> bool {
        let state = self.state.lock().expect("session lock poisoned");
        state.phone.is_some() && state.agent.is_some()
    }

    /// (phone occupied, agent occupied)
    pub fn occupancy(&self) -> (bool, bool) {
        let state = self.state.lock().expect("session lock poisoned");
        (state.phone.is_some(), state.agent.is_some())
    }

    /// Both members, for teardown on token revocation.
    pub fn members(&self) -> (Option<Arc<Connection>>, Option<Arc<Connection>>) {
        let state = self.state.lock().expect("session lock poisoned");
        (state.phone.clone(), state.agent.clone())
    }

    /// Idle = both slots empty and last activity older than `timeout`.
    /// A session that never saw activity counts as idle.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        let state = self.state.lock().expect("session lock poisoned");
        if state.phone.is_some() || state.agent.is_some() {
            return false;
        }
        match state.last_active {
            Some(at) => at.elapsed() > timeout,
            None => true,
        }
    }

}
