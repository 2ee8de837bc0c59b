//! Shared HTTP request helpers for CLI commands.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub struct Client {
    base_url: String,
    admin_key: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: String, admin_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            admin_key,
            http: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_admin(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.admin_key {
            Some(key) => req.header("X-Admin-Key", key),
            None => req,
        }
    }

    pub async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let resp = self
            .with_admin(self.http.get(self.url(path)))
            .send()
            .await
            .with_context(|| format!("failed to connect to relay at {} — is it running?", self.base_url))?;
        check(&resp)?;
        resp.json().await.context("failed to parse response")
    }

    pub async fn post_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let resp = self
            .with_admin(self.http.post(self.url(path)))
            .send()
            .await
            .with_context(|| format!("failed to connect to relay at {} — is it running?", self.base_url))?;
        check(&resp)?;
        resp.json().await.context("failed to parse response")
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let resp = self
            .with_admin(self.http.delete(self.url(path)))
            .send()
            .await
            .with_context(|| format!("failed to connect to relay at {} — is it running?", self.base_url))?;
        check(&resp)?;
        Ok(())
    }
}

fn check(resp: &reqwest::Response) -> Result<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    if status == reqwest::StatusCode::UNAUTHORIZED {
        bail!("unauthorized — missing or wrong admin key");
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        bail!("rate limited — try again later");
    }
    bail!("relay returned {status}");
}
