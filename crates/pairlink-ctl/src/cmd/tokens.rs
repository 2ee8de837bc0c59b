//! Token listing command.

use anyhow::Result;
use serde::Deserialize;

use super::http::Client;

#[derive(Deserialize)]
struct TokenListResponse {
    tokens: Vec<TokenEntry>,
}

#[derive(Deserialize)]
struct TokenEntry {
    token: String,
    created_at: String,
}

pub async fn run(client: &Client) -> Result<()> {
    let resp: TokenListResponse = client.get_json("/api/v1/tokens").await?;

    if resp.tokens.is_empty() {
        println!("No tokens.");
        return Ok(());
    }

    println!("  {} token(s):", resp.tokens.len());
    for t in &resp.tokens {
        println!("  {}  (created {})", t.token, t.created_at);
    }

    Ok(())
}
