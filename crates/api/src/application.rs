use std::sync::Arc;

use actix_web::{middleware::Logger, web, App, HttpServer};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use waypost_coordination::{
    connect, ConfigError, ConfigLoader, ConfigWatcher, HttpCoordinationClient, RegisteredInstance,
    ServiceRegistrar,
};
use waypost_domain::{
    config::{BootstrapConfig, CoordinationSettings, MissingSection, SettingsError},
    init_telemetry,
    telemetry::TelemetryError,
    AppInfo, ConfigHandle, TelemetryConfig,
};

use crate::{
    handlers::{health_handler, metrics_handler},
    state::AppState,
};

pub async fn run() -> Result<(), BootstrapError> {
    // 1. Environment settings and telemetry come first so every later step
    //    can log through the subscriber.
    let settings = CoordinationSettings::from_env()?;
    let telemetry = init_telemetry(&TelemetryConfig::from_env("WAYPOST"))?;

    // 2. First configuration load is the startup gate: nothing downstream
    //    can run without a valid config.
    let client = connect(&settings)?;
    let loader = ConfigLoader::new(Arc::clone(&client), settings.key_path());
    let (config, version) = loader.load().await?;
    info!(version, key = settings.key_path(), "configuration loaded");

    let handle = ConfigHandle::new(config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 3. Keep the config current for the life of the process. The watcher
    //    starts from cursor zero so its first poll returns the value we
    //    just loaded (the baseline seed) and any change landing during the
    //    first watch window still fires the callback.
    let watcher = ConfigWatcher::new(Arc::clone(&client), settings.key_path(), 0);
    let watcher_task = watcher.spawn(shutdown_rx.clone(), {
        let handle = handle.clone();
        move |next| handle.replace(next)
    });

    let bind_addr = handle
        .current()
        .server_addr()
        .map(str::to_string)
        .ok_or(ConfigError::Invalid {
            section: MissingSection::Server,
        })?;

    // 4. Register in the service catalog and start heartbeating. Every
    //    failure on this path degrades discoverability only.
    let registrar = match AppInfo::from_env() {
        Ok(app) => build_registrar(&settings, &handle.current(), &app, parse_port(&bind_addr)?),
        Err(err) => {
            warn!(%err, "could not resolve process identity, service discovery disabled");
            None
        }
    };
    if let Some(registrar) = &registrar {
        match registrar.register().await {
            Ok(()) => {
                if let Some(pinger) = registrar.heartbeat() {
                    tokio::spawn(pinger.run(shutdown_rx.clone()));
                }
            }
            Err(err) => {
                warn!(%err, "registration failed, continuing without service discovery");
            }
        }
    }

    // 5. Serve until the process is asked to stop.
    let state = AppState::new(handle.clone(), telemetry);
    info!(addr = %bind_addr, "starting http server");
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(Logger::default())
            .route("/healthz", web::get().to(health_handler))
            .route("/metrics", web::get().to(metrics_handler))
    })
    .bind(&bind_addr)?
    .run()
    .await?;

    // 6. Shutdown: signal the background tasks, then drop the catalog
    //    entry. The heartbeat task is signaled but not joined; a final
    //    in-flight ping racing the deregister is harmless since both are
    //    idempotent on the server side.
    let _ = shutdown_tx.send(true);
    if let Some(registrar) = &registrar {
        if let Err(err) = registrar.deregister().await {
            warn!(%err, "deregistration failed during shutdown");
        }
    }
    let _ = watcher_task.await;

    Ok(())
}

/// Builds the registrar from the discovery section, or explains why the
/// process will run undiscoverable. The catalog agent address comes from
/// the loaded config and may differ from the config-center address.
fn build_registrar(
    settings: &CoordinationSettings,
    config: &BootstrapConfig,
    app: &AppInfo,
    port: u16,
) -> Option<Arc<ServiceRegistrar<HttpCoordinationClient>>> {
    if settings.registration_disabled() {
        info!("service discovery disabled via DISABLE_DISCOVERY");
        return None;
    }

    let Some(consul) = config.discovery_consul() else {
        info!("no discovery endpoint configured, registration skipped");
        return None;
    };

    let address = if consul.addr.starts_with("http://") || consul.addr.starts_with("https://") {
        consul.addr.clone()
    } else {
        format!("{}://{}", consul.scheme, consul.addr)
    };

    let client = match HttpCoordinationClient::new(&address, None) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            warn!(%err, %address, "could not reach discovery endpoint, registration skipped");
            return None;
        }
    };

    let instance = RegisteredInstance::from_identity(app, port, consul.scheme.clone());
    info!(id = %instance.id, %address, "initialized service registrar");
    Some(Arc::new(ServiceRegistrar::new(client, instance)))
}

fn parse_port(addr: &str) -> Result<u16, BootstrapError> {
    addr.rsplit(':')
        .next()
        .and_then(|port| port.parse().ok())
        .ok_or_else(|| BootstrapError::InvalidBindAddress(addr.to_string()))
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("invalid server bind address `{0}`")]
    InvalidBindAddress(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
