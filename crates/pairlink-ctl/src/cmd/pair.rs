//! Pairing-token commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::Client;

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Deserialize)]
struct PairStatusResponse {
    phone: bool,
    agent: bool,
}

pub async fn new_token(client: &Client) -> Result<()> {
    let resp: TokenResponse = client.post_json("/api/v1/pair").await?;
    println!("{}", resp.token);
    Ok(())
}

pub async fn register(client: &Client) -> Result<()> {
    let resp: TokenResponse = client.post_json("/api/v1/register").await?;
    println!("{}", resp.token);
    Ok(())
}

pub async fn status(client: &Client, token: &str) -> Result<()> {
    let resp: PairStatusResponse = client.get_json(&format!("/api/v1/pair/{token}")).await?;

    let mark = |online: bool| if online { "online" } else { "offline" };
    println!("  phone : {}", mark(resp.phone));
    println!("  agent : {}", mark(resp.agent));

    Ok(())
}

pub async fn revoke(client: &Client, token: &str) -> Result<()> {
    client.delete(&format!("/api/v1/pair/{token}")).await?;
    println!("✓ Token revoked: {}...", &token[..16.min(token.len())]);
    Ok(())
}
