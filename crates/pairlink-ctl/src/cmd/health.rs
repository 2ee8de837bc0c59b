//! Relay health command.

use anyhow::Result;
use serde::Deserialize;

use super::http::Client;

#[derive(Deserialize)]
struct HealthResponse {
    status: String,
    connections: i64,
    sessions: usize,
    uptime_sec: u64,
    memory_mb: u64,
    task_count: usize,
}

pub async fn run(client: &Client) -> Result<()> {
    let resp: HealthResponse = client.get_json("/health").await?;

    println!("═══════════════════════════════════════");
    println!("  Relay Health");
    println!("═══════════════════════════════════════");
    println!("  Status      : {}", resp.status);
    println!("  Connections : {}", resp.connections);
    println!("  Sessions    : {}", resp.sessions);
    println!("  Uptime      : {}s", resp.uptime_sec);
    println!("  Memory      : {} MB", resp.memory_mb);
    println!("  Tasks       : {}", resp.task_count);

    Ok(())
}
