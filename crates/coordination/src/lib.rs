//! Coordination subsystem: keeps the process registered with the external
//! coordination service and its configuration current.
//!
//! The [`client::CoordinationClient`] trait is the single transport seam;
//! everything above it ([`loader::ConfigLoader`], [`watcher::ConfigWatcher`],
//! [`registry::ServiceRegistrar`], [`registry::HeartbeatPinger`]) is written
//! against the trait so tests can script the remote side.

pub mod client;
pub mod loader;
pub mod registry;
pub mod watcher;

pub use client::{CoordinationClient, HttpCoordinationClient, KeyValue, TransportError};
pub use loader::{connect, ConfigError, ConfigLoader};
pub use registry::{HeartbeatPinger, RegisteredInstance, RegistryError, ServiceRegistrar};
pub use watcher::ConfigWatcher;
