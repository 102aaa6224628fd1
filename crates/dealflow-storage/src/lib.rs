//! Persistence sinks, run audit and HTTP fetch utilities for dealflow.

pub mod audit;
pub mod sink;

use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub use audit::{
    AuditError, AuditEvent, AuditLevel, AuditSink, BestEffortAudit, NoopAudit, PgRunAudit,
    RunRecord, RunStatus,
};
pub use sink::{
    MemoryListingSink, PersistenceError, PersistenceSink, PgListingSink, UpsertOutcome,
    LISTINGS_CONFLICT_KEY, LISTINGS_TABLE,
};

pub const CRATE_NAME: &str = "dealflow-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Upper bound for a single request, including reading the body.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub default_headers: Vec<(String, String)>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            default_headers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::HttpStatus { status, .. } => Some(*status),
        }
    }
}

/// Thin reqwest wrapper. One attempt per call; callers decide what a failure means.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name}"))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_get", %run_id, url);
        async {
            let resp = self.client.get(url).send().await?;
            read_success(resp).await
        }
        .instrument(span)
        .await
    }

    /// Like `get`, but hands back non-2xx responses instead of failing on them.
    pub async fn get_any_status(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_get", %run_id, url);
        async {
            let resp = self.client.get(url).send().await?;
            read_response(resp).await
        }
        .instrument(span)
        .await
    }

    pub async fn post_json(
        &self,
        run_id: Uuid,
        url: &str,
        bearer_token: Option<&str>,
        body: &JsonValue,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_post", %run_id, url);
        async {
            let mut request = self.client.post(url).json(body);
            if let Some(token) = bearer_token {
                request = request.header(AUTHORIZATION, format!("Bearer {token}"));
            }
            let resp = request.send().await?;
            read_success(resp).await
        }
        .instrument(span)
        .await
    }
}

async fn read_success(resp: reqwest::Response) -> Result<FetchedResponse, FetchError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: resp.url().to_string(),
        });
    }
    read_response(resp).await
}

async fn read_response(resp: reqwest::Response) -> Result<FetchedResponse, FetchError> {
    let status = resp.status();
    let final_url = resp.url().to_string();
    let headers = resp.headers().clone();
    let body = resp.bytes().await?.to_vec();
    Ok(FetchedResponse {
        status,
        final_url,
        headers,
        body,
    })
}
