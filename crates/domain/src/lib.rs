//! Domain-level building blocks shared by the coordination and API crates:
//! the typed bootstrap configuration model, the current-config holder,
//! process identity, and telemetry bootstrap.

pub mod config;
pub mod identity;
pub mod telemetry;

pub use config::{BootstrapConfig, ConfigHandle, CoordinationSettings, MissingSection};
pub use identity::AppInfo;
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
