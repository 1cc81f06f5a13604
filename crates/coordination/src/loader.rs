//! One-shot fetch and decode of the bootstrap configuration.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use waypost_domain::config::{BootstrapConfig, CoordinationSettings, MissingSection};

use crate::client::{CoordinationClient, HttpCoordinationClient, TransportError};

/// Configuration subsystem errors. On first load every variant is fatal to
/// startup; on reload the watcher contains them locally instead.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("coordination service address is not configured")]
    Unavailable,
    #[error("configuration key `{path}` not found")]
    NotFound { path: String },
    #[error("coordination service unreachable: {source}")]
    Unreachable {
        #[source]
        source: TransportError,
    },
    #[error("failed to decode configuration: {0}")]
    Malformed(String),
    #[error("configuration missing required `{section}` section")]
    Invalid { section: MissingSection },
}

/// Builds the shared transport handle from environment settings. Fails with
/// [`ConfigError::Unavailable`] when no address is configured: no config
/// means no service.
pub fn connect(
    settings: &CoordinationSettings,
) -> Result<Arc<HttpCoordinationClient>, ConfigError> {
    let address = settings.address().ok_or(ConfigError::Unavailable)?;
    HttpCoordinationClient::new(address, settings.token().map(str::to_string))
        .map(Arc::new)
        .map_err(|source| ConfigError::Unreachable { source })
}

/// One-shot loader for the configuration key.
pub struct ConfigLoader<C> {
    client: Arc<C>,
    key_path: String,
}

impl<C: CoordinationClient> ConfigLoader<C> {
    pub fn new(client: Arc<C>, key_path: impl Into<String>) -> Self {
        Self {
            client,
            key_path: key_path.into(),
        }
    }

    /// Fetches, decodes, and validates the configuration blob. Returns the
    /// decoded config together with the key's version so the watcher can
    /// pick up where the load left off.
    pub async fn load(&self) -> Result<(BootstrapConfig, u64), ConfigError> {
        let pair = self
            .client
            .get_key(&self.key_path)
            .await
            .map_err(|source| ConfigError::Unreachable { source })?;

        let Some(kv) = pair else {
            return Err(ConfigError::NotFound {
                path: self.key_path.clone(),
            });
        };

        let config = decode_blob(&kv.value)?;
        config
            .validate()
            .map_err(|section| ConfigError::Invalid { section })?;

        debug!(key = %self.key_path, version = kv.version, "configuration blob decoded");
        Ok((config, kv.version))
    }
}

/// Decodes a raw YAML blob into the typed model via an untyped intermediate
/// value, mirroring how the remote side stores it.
pub(crate) fn decode_blob(raw: &[u8]) -> Result<BootstrapConfig, ConfigError> {
    let blob: serde_yaml::Value =
        serde_yaml::from_slice(raw).map_err(|err| ConfigError::Malformed(err.to_string()))?;
    serde_yaml::from_value(blob).map_err(|err| ConfigError::Malformed(err.to_string()))
}
