//! Typed bootstrap configuration and its environment-derived settings.
//!
//! `BootstrapConfig` is decoded from the blob stored in the coordination
//! service's KV store. Field names are snake_case to match the remote keys,
//! so no rename attributes are needed on the model. A decoded value is an
//! immutable snapshot; reloads replace the whole tree, never merge into it.

use std::{env, sync::Arc};

use arc_swap::ArcSwap;
use serde::Deserialize;
use thiserror::Error;

/// Default KV path for the configuration blob when `CONFIG_PATH` is unset.
pub const DEFAULT_KEY_PATH: &str = "configs/config.yaml";

/// Decoded configuration tree for the whole process.
///
/// Every section is optional at the decoding layer; [`BootstrapConfig::validate`]
/// enforces the required ones so a structurally incomplete blob is rejected
/// with a section name instead of a serde error.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub data: Option<DataConfig>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub trace: Option<TraceConfig>,
    #[serde(default)]
    pub discovery: Option<DiscoveryConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub http: Option<HttpServerConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HttpServerConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DataConfig {
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AuthConfig {
    pub endpoint: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub organization_name: String,
    #[serde(default)]
    pub application_name: String,
    #[serde(default)]
    pub certificate: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TraceConfig {
    pub endpoint: String,
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub consul: Option<ConsulDiscoveryConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConsulDiscoveryConfig {
    pub addr: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

fn default_scheme() -> String {
    "http".to_string()
}

impl BootstrapConfig {
    /// Checks that every required section is present, in a fixed order:
    /// server, data, auth, trace, discovery. The first missing section wins,
    /// which callers rely on when reporting errors.
    pub fn validate(&self) -> Result<(), MissingSection> {
        if self.server.as_ref().and_then(|s| s.http.as_ref()).is_none() {
            return Err(MissingSection::Server);
        }
        if self.data.is_none() {
            return Err(MissingSection::Data);
        }
        if self.auth.is_none() {
            return Err(MissingSection::Auth);
        }
        if self.trace.is_none() {
            return Err(MissingSection::Trace);
        }
        if self.discovery.is_none() {
            return Err(MissingSection::Discovery);
        }
        Ok(())
    }

    /// Bind address declared in the server section, if the section exists.
    pub fn server_addr(&self) -> Option<&str> {
        self.server
            .as_ref()
            .and_then(|s| s.http.as_ref())
            .map(|h| h.addr.as_str())
    }

    /// Consul endpoint declared in the discovery section, if any.
    pub fn discovery_consul(&self) -> Option<&ConsulDiscoveryConfig> {
        self.discovery.as_ref().and_then(|d| d.consul.as_ref())
    }
}

/// Required configuration section that was absent from a decoded blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MissingSection {
    #[error("server")]
    Server,
    #[error("data")]
    Data,
    #[error("auth")]
    Auth,
    #[error("trace")]
    Trace,
    #[error("discovery")]
    Discovery,
}

/// Owner of the process-wide "current configuration" value.
///
/// Replacements are single atomic pointer swaps, so concurrent readers
/// always observe either the previous snapshot or the next one, never a
/// partially updated tree.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<BootstrapConfig>>,
}

impl ConfigHandle {
    pub fn new(initial: BootstrapConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    pub fn current(&self) -> Arc<BootstrapConfig> {
        self.inner.load_full()
    }

    pub fn replace(&self, next: BootstrapConfig) {
        self.inner.store(Arc::new(next));
    }
}

/// Environment-derived settings for reaching the coordination service.
///
/// All entries are optional overrides layered over defaults; only the
/// address has no default, since without it the subsystem cannot run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationSettings {
    address: Option<String>,
    key_path: String,
    token: Option<String>,
    registration_disabled: bool,
}

impl CoordinationSettings {
    /// Loads settings by hydrating `.env` (if present) and reading
    /// `CONFIG_CENTER`, `CONFIG_PATH`, `CONFIG_CENTER_TOKEN`, and
    /// `DISABLE_DISCOVERY` from the process environment.
    pub fn from_env() -> Result<Self, SettingsError> {
        hydrate_env_file()?;

        Ok(Self {
            address: get_optional_var("CONFIG_CENTER"),
            key_path: get_optional_var("CONFIG_PATH")
                .unwrap_or_else(|| DEFAULT_KEY_PATH.to_string()),
            token: get_optional_var("CONFIG_CENTER_TOKEN"),
            registration_disabled: get_optional_var("DISABLE_DISCOVERY")
                .map(|value| value.eq_ignore_ascii_case("true") || value == "1")
                .unwrap_or(false),
        })
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn key_path(&self) -> &str {
        &self.key_path
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn registration_disabled(&self) -> bool {
        self.registration_disabled
    }
}

fn get_optional_var(key: &'static str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

pub(crate) fn hydrate_env_file() -> Result<(), SettingsError> {
    if env::var_os("WAYPOST_SKIP_DOTENV").is_some() {
        return Ok(());
    }
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(SettingsError::Dotenv { source: err }),
    }

    Ok(())
}

/// Errors emitted while reading process-level settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load .env file: {source}")]
    Dotenv {
        #[from]
        source: dotenvy::Error,
    },
}
