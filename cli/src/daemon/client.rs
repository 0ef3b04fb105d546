// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP client for communicating with the daemon API

use anyhow::{Context, Result};
use futures::{Stream, StreamExt};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use stackpilot_core::domain::runtime::LogOptions;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    details: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DaemonClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl DaemonClient {
    pub fn new(host: &str, port: u16, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            // No global timeout: deploys and followed logs are long-lived
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url(host, port),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach daemon at {} ({})", self.base_url, what))?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) if body.details.is_empty() => {
                anyhow::bail!("{} failed ({}): {}", what, status, body.error)
            }
            Ok(body) => anyhow::bail!(
                "{} failed ({}): {}\n  - {}",
                what,
                status,
                body.error,
                body.details.join("\n  - ")
            ),
            Err(_) => anyhow::bail!("{} failed ({}): {}", what, status, text.trim()),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.request(Method::GET, path), path)
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to parse response of {}", path))
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.send(self.request(Method::POST, path).json(body), path)
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to parse response of {}", path))
    }

    pub async fn put<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.send(self.request(Method::PUT, path).json(body), path)
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to parse response of {}", path))
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.send(self.request(Method::DELETE, path), path).await?;
        Ok(())
    }

    /// `true` when `/health` answers.
    pub async fn is_up(&self) -> bool {
        match self.request(Method::GET, "/health").send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Raw log bytes of `path` (`/logs/<svc>` or `/agents/<name>/logs`).
    pub async fn logs(
        &self,
        path: &str,
        options: &LogOptions,
    ) -> Result<impl Stream<Item = Result<Vec<u8>>>> {
        let response = self
            .send(self.request(Method::GET, path).query(options), path)
            .await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).context("Log stream interrupted")))
    }

    pub async fn health(&self) -> Result<Value> {
        self.get("/health").await
    }
}

pub fn base_url(host: &str, port: u16) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}:{}", host.trim_end_matches('/'), port)
    } else {
        format!("http://{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("127.0.0.1", 7400), "http://127.0.0.1:7400");
        assert_eq!(base_url("https://ops.example.com", 443), "https://ops.example.com:443");
    }

    #[tokio::test]
    async fn test_error_body_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/config")
            .match_header("authorization", "Bearer k")
            .with_status(400)
            .with_body(r#"{"error":"stack spec is invalid (2 problems)","details":["a","b"]}"#)
            .create_async()
            .await;

        let client = DaemonClient {
            client: Client::new(),
            base_url: server.url(),
            api_key: Some("k".into()),
        };
        let err = client
            .post::<_, Value>("/config", &serde_json::json!({}))
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("400"));
        assert!(err.contains("- a"));
    }

    #[tokio::test]
    async fn test_get_parses_json() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/health")
            .with_status(200)
            .with_body(r#"{"status":"ok","uptime_seconds":3}"#)
            .create_async()
            .await;
        let client = DaemonClient {
            client: Client::new(),
            base_url: server.url(),
            api_key: None,
        };
        assert!(client.is_up().await);
        assert_eq!(client.health().await.unwrap()["uptime_seconds"], 3);
    }
}
