use waypost_domain::{ConfigHandle, TelemetryGuard};

#[derive(Clone)]
pub struct AppState {
    config: ConfigHandle,
    telemetry: TelemetryGuard,
}

impl AppState {
    pub fn new(config: ConfigHandle, telemetry: TelemetryGuard) -> Self {
        Self { config, telemetry }
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn telemetry(&self) -> &TelemetryGuard {
        &self.telemetry
    }
}
