//! Process identity used for service registration.

use std::{env, net::UdpSocket};

use thiserror::Error;
use uuid::Uuid;

/// Identity of this running instance: a per-process unique ID plus the
/// declared service name, version, deployment environment, and the host
/// address other instances can reach us on. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    id: String,
    name: String,
    version: String,
    environment: String,
    host: String,
}

impl AppInfo {
    /// Builds the identity from `SERVICE_NAME`, `SERVICE_VERSION`, and
    /// `DEPLOY_ENVIRONMENT` (each with a default), resolving the outbound
    /// host address and generating a fresh instance ID.
    pub fn from_env() -> Result<Self, IdentityError> {
        let name = env::var("SERVICE_NAME").unwrap_or_else(|_| "waypost".to_string());
        let version =
            env::var("SERVICE_VERSION").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());
        let environment = env::var("DEPLOY_ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let host = outbound_host()?;
        Ok(Self::new(name, version, environment, host))
    }

    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        environment: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            id: format!("{}-{}", name, Uuid::new_v4()),
            name,
            version: version.into(),
            environment: environment.into(),
            host: host.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

/// Resolves the non-loopback local address by connecting a UDP socket to a
/// public endpoint. No packet is sent; the OS just picks the outbound
/// interface for us.
pub fn outbound_host() -> Result<String, IdentityError> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip().to_string())
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to determine outbound host address: {0}")]
    Outbound(#[from] std::io::Error),
}
