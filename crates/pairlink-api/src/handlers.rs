//! HTTP admin and health handlers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Serialize;

use pairlink_services::Hub;

#[derive(Clone)]
pub struct ApiState {
    pub hub: Arc<Hub>,
    /// X-Admin-Key value required on admin endpoints. None = unguarded.
    pub admin_key: Option<String>,
    pub reg_limiter: Arc<IpRateLimiter>,
}

impl ApiState {
    pub fn new(hub: Arc<Hub>, admin_key: Option<String>) -> Self {
        Self {
            hub,
            admin_key,
            // 5 registrations per hour per IP.
            reg_limiter: Arc::new(IpRateLimiter::new(5, Duration::from_secs(3600))),
        }
    }

    fn check_admin(&self, headers: &HeaderMap) -> bool {
        match &self.admin_key {
            None => true,
            Some(key) => headers
                .get("x-admin-key")
                .and_then(|v| v.to_str().ok())
                .map(|v| v == key)
                .unwrap_or(false),
        }
    }
}

/// Sliding-window request limiter keyed by client IP.
pub struct IpRateLimiter {
    entries: Mutex<HashMap<String, Vec<Instant>>>,
    limit: usize,
    window: Duration,
}

impl IpRateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }

    pub fn allow(&self, ip: &str) -> bool {
        let mut entries = self.entries.lock().expect("limiter lock poisoned");
        let now = Instant::now();
        let hits = entries.entry(ip.to_string()).or_default();
        hits.retain(|t| now.duration_since(*t) < self.window);
        if hits.len() >= self.limit {
            return false;
        }
        hits.push(now);
        true
    }
}

/// Client IP for rate limiting: first X-Forwarded-For hop, else the
/// connecting address.
fn client_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    if let Some(fwd) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = fwd.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    addr.ip().to_string()
}

// ── /health ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: i64,
    pub sessions: usize,
    pub uptime_sec: u64,
    pub memory_mb: u64,
    pub task_count: usize,
}

pub async fn handle_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.hub.connection_count(),
        sessions: state.hub.session_count(),
        uptime_sec: state.hub.uptime().as_secs(),
        memory_mb: process_memory_mb(),
        task_count: tokio::runtime::Handle::current().metrics().num_alive_tasks(),
    })
}

fn process_memory_mb() -> u64 {
    use sysinfo::{ProcessesToUpdate, System};

    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|p| p.memory() / 1024 / 1024).unwrap_or(0)
}

// ── /api/v1/pair ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct TokenResponse {
    pub token: String,
}

pub async fn handle_pair_create(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<TokenResponse>), StatusCode> {
    if !state.check_admin(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let token = state.hub.create_token().map_err(|e| {
        tracing::error!(error = %e, "token creation failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok((StatusCode::CREATED, Json(TokenResponse { token })))
}

#[derive(Serialize)]
pub struct PairStatusResponse {
    pub phone: bool,
    pub agent: bool,
}

pub async fn handle_pair_status(
    State(state): State<ApiState>,
    Path(token): Path<String>,
) -> Json<PairStatusResponse> {
    let (phone, agent) = state.hub.token_status(&token);
    Json(PairStatusResponse { phone, agent })
}

pub async fn handle_pair_delete(
    State(state): State<ApiState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, StatusCode> {
    if !state.check_admin(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    state.hub.delete_token(&token).map_err(|e| {
        tracing::error!(error = %e, "token deletion failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(StatusCode::NO_CONTENT)
}

// ── /api/v1/register ──────────────────────────────────────────────────────────

pub async fn handle_register(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<TokenResponse>), (StatusCode, String)> {
    let ip = client_ip(&headers, &addr);
    if !state.reg_limiter.allow(&ip) {
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            "Rate limit exceeded (5/hour)".to_string(),
        ));
    }

    let token = state.hub.create_token().map_err(|e| {
        tracing::error!(error = %e, "token creation failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to create token".to_string(),
        )
    })?;
    Ok((StatusCode::CREATED, Json(TokenResponse { token })))
}

// ── /api/v1/tokens ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct TokenListResponse {
    pub tokens: Vec<TokenEntry>,
}

#[derive(Serialize)]
pub struct TokenEntry {
    pub token: String,
    pub created_at: String,
}

pub async fn handle_token_list(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<TokenListResponse>, StatusCode> {
    if !state.check_admin(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let tokens = state.hub.list_tokens().map_err(|e| {
        tracing::error!(error = %e, "token list failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(TokenListResponse {
        tokens: tokens
            .into_iter()
            .map(|t| TokenEntry {
                token: t.token,
                created_at: t.created_at,
            })
            .collect(),
    }))
}
