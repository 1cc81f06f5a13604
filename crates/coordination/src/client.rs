//! HTTP transport to the coordination service, behind a trait seam.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default timeout for one-shot calls (register, deregister, TTL update,
/// plain reads). Long-poll reads get a widened per-request timeout instead.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Extra slack on top of the server-side wait for long-poll requests, so a
/// full-length wait is not misreported as a transport error.
const WATCH_TIMEOUT_MARGIN: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("coordination service returned status {status}")]
    UnexpectedStatus { status: u16 },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(value: reqwest::Error) -> Self {
        Self::Request(value.to_string())
    }
}

/// A versioned value read from the KV store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub value: Vec<u8>,
    pub version: u64,
}

/// Catalog entry submitted on registration. Field names follow the
/// coordination service's wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
    #[serde(rename = "Check")]
    pub check: TtlCheck,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TtlCheck {
    #[serde(rename = "TTL")]
    pub ttl: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    pub deregister_critical_service_after: String,
}

/// Transport contract consumed by the loader, watcher, registrar, and
/// pinger. Implementations hold no per-call mutable state, so a single
/// instance is safe to share across concurrent independent calls.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// One-shot read of a key. `None` means the key is absent.
    async fn get_key(&self, path: &str) -> Result<Option<KeyValue>, TransportError>;

    /// Long-poll read: blocks server-side until the key's version exceeds
    /// `cursor` or `wait` elapses. A cursor of zero returns immediately.
    async fn watch_key(
        &self,
        path: &str,
        cursor: u64,
        wait: Duration,
    ) -> Result<Option<KeyValue>, TransportError>;

    async fn register_service(
        &self,
        registration: &ServiceRegistration,
    ) -> Result<(), TransportError>;

    async fn deregister_service(&self, instance_id: &str) -> Result<(), TransportError>;

    /// Reports "passing" for a TTL check.
    async fn update_ttl(&self, check_id: &str, note: &str) -> Result<(), TransportError>;
}

/// Consul-compatible HTTP implementation of [`CoordinationClient`].
#[derive(Debug)]
pub struct HttpCoordinationClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpCoordinationClient {
    pub fn new(address: &str, token: Option<String>) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: normalize_base_url(address),
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.header("X-Consul-Token", token);
        }
        builder
    }

    async fn read_key(
        &self,
        path: &str,
        watch: Option<(u64, Duration)>,
    ) -> Result<Option<KeyValue>, TransportError> {
        let url = format!("{}/v1/kv/{}", self.base_url, path);
        let mut builder = self.request(reqwest::Method::GET, url);
        if let Some((cursor, wait)) = watch {
            builder = builder
                .query(&[
                    ("index", cursor.to_string()),
                    ("wait", format!("{}s", wait.as_secs())),
                ])
                .timeout(wait + WATCH_TIMEOUT_MARGIN);
        }

        let response = builder.send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(TransportError::UnexpectedStatus {
                status: response.status().as_u16(),
            });
        }

        let entries: Vec<KvEntry> = response.json().await?;
        decode_entries(entries)
    }

    async fn ensure_success(response: reqwest::Response) -> Result<(), TransportError> {
        if !response.status().is_success() {
            return Err(TransportError::UnexpectedStatus {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationClient for HttpCoordinationClient {
    async fn get_key(&self, path: &str) -> Result<Option<KeyValue>, TransportError> {
        self.read_key(path, None).await
    }

    async fn watch_key(
        &self,
        path: &str,
        cursor: u64,
        wait: Duration,
    ) -> Result<Option<KeyValue>, TransportError> {
        self.read_key(path, Some((cursor, wait))).await
    }

    async fn register_service(
        &self,
        registration: &ServiceRegistration,
    ) -> Result<(), TransportError> {
        let url = format!("{}/v1/agent/service/register", self.base_url);
        let response = self
            .request(reqwest::Method::PUT, url)
            .json(registration)
            .send()
            .await?;
        Self::ensure_success(response).await
    }

    async fn deregister_service(&self, instance_id: &str) -> Result<(), TransportError> {
        let url = format!(
            "{}/v1/agent/service/deregister/{}",
            self.base_url, instance_id
        );
        let response = self.request(reqwest::Method::PUT, url).send().await?;
        Self::ensure_success(response).await
    }

    async fn update_ttl(&self, check_id: &str, note: &str) -> Result<(), TransportError> {
        let url = format!("{}/v1/agent/check/update/{}", self.base_url, check_id);
        let response = self
            .request(reqwest::Method::PUT, url)
            .json(&serde_json::json!({ "Status": "passing", "Output": note }))
            .send()
            .await?;
        Self::ensure_success(response).await
    }
}

/// KV read response entry; values come back base64-encoded.
#[derive(Debug, Deserialize)]
struct KvEntry {
    #[serde(rename = "Value")]
    value: Option<String>,
    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
}

fn decode_entries(entries: Vec<KvEntry>) -> Result<Option<KeyValue>, TransportError> {
    let Some(entry) = entries.into_iter().next() else {
        return Ok(None);
    };

    let value = match entry.value {
        Some(encoded) => BASE64
            .decode(encoded.as_bytes())
            .map_err(|err| TransportError::InvalidPayload(err.to_string()))?,
        None => Vec::new(),
    };

    Ok(Some(KeyValue {
        value,
        version: entry.modify_index,
    }))
}

fn normalize_base_url(address: &str) -> String {
    let trimmed = address.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}
