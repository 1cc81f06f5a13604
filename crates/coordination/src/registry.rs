//! Service catalog registration and TTL heartbeating.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
    time::Duration,
};

use metrics::counter;
use thiserror::Error;
use tokio::{sync::watch, time::sleep};
use tracing::{debug, info, warn};

use waypost_domain::identity::AppInfo;

use crate::client::{CoordinationClient, ServiceRegistration, TransportError, TtlCheck};

/// TTL the coordination service enforces on the health check.
pub const TTL_DURATION: &str = "30s";

/// How long the entry may stay critical before the coordination service
/// deregisters it on its own.
pub const DEREGISTER_AFTER: &str = "1m";

/// Heartbeat period, deliberately shorter than the TTL to leave margin for
/// a missed ping.
pub const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Catalog identity of this process. Created once at startup; never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredInstance {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub scheme: String,
}

impl RegisteredInstance {
    /// Catalog entries are named `<service>-<version>` so multiple versions
    /// can coexist in the catalog.
    pub fn from_identity(app: &AppInfo, port: u16, scheme: impl Into<String>) -> Self {
        Self {
            id: app.id().to_string(),
            name: format!("{}-{}", app.name(), app.version()),
            host: app.host().to_string(),
            port,
            scheme: scheme.into(),
        }
    }

    /// The coordination service requires TTL check IDs in the
    /// `service:<instance id>` form.
    pub fn check_id(&self) -> String {
        format!("service:{}", self.id)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("service registration failed: {source}")]
    RegistrationFailed {
        #[source]
        source: TransportError,
    },
    #[error("service deregistration failed: {source}")]
    DeregistrationFailed {
        #[source]
        source: TransportError,
    },
}

/// Registers the instance in the service catalog and removes it on
/// shutdown. Callers treat both operations as best-effort: a failure
/// degrades discoverability, never the service itself.
pub struct ServiceRegistrar<C> {
    client: Arc<C>,
    instance: RegisteredInstance,
    registered: AtomicBool,
}

impl<C: CoordinationClient> ServiceRegistrar<C> {
    pub fn new(client: Arc<C>, instance: RegisteredInstance) -> Self {
        Self {
            client,
            instance,
            registered: AtomicBool::new(false),
        }
    }

    pub fn instance(&self) -> &RegisteredInstance {
        &self.instance
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Submits the catalog entry with a TTL health check and an automatic
    /// deregister-if-critical policy.
    pub async fn register(&self) -> Result<(), RegistryError> {
        let registration = ServiceRegistration {
            id: self.instance.id.clone(),
            name: self.instance.name.clone(),
            address: self.instance.host.clone(),
            port: self.instance.port,
            tags: vec![self.instance.name.clone(), "ttl".to_string()],
            check: TtlCheck {
                ttl: TTL_DURATION.to_string(),
                deregister_critical_service_after: DEREGISTER_AFTER.to_string(),
            },
        };

        self.client
            .register_service(&registration)
            .await
            .map_err(|source| RegistryError::RegistrationFailed { source })?;

        self.registered.store(true, Ordering::SeqCst);
        info!(id = %self.instance.id, ttl = TTL_DURATION, "service registered with ttl check");
        Ok(())
    }

    /// Removes the catalog entry. A no-op success when no registration is
    /// active, so shutdown paths can call it unconditionally.
    pub async fn deregister(&self) -> Result<(), RegistryError> {
        if !self.registered.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        info!(id = %self.instance.id, "deregistering service");
        self.client
            .deregister_service(&self.instance.id)
            .await
            .map_err(|source| RegistryError::DeregistrationFailed { source })
    }

    /// Hands out a heartbeat pinger only while a registration is active,
    /// so a ping loop cannot start before `register` succeeded.
    pub fn heartbeat(&self) -> Option<HeartbeatPinger<C>> {
        self.is_registered().then(|| HeartbeatPinger {
            client: Arc::clone(&self.client),
            check_id: self.instance.check_id(),
            interval: PING_INTERVAL,
        })
    }
}

/// Background loop reporting "passing" for the registered TTL check.
pub struct HeartbeatPinger<C> {
    client: Arc<C>,
    check_id: String,
    interval: Duration,
}

impl<C: CoordinationClient> HeartbeatPinger<C> {
    /// Blocks until `shutdown` fires (or its sender is dropped). A failed
    /// update is logged and the loop continues; the coordination service
    /// only marks the instance critical after the full TTL window lapses.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(check_id = %self.check_id, interval = ?self.interval, "starting ttl pinger");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!(check_id = %self.check_id, "ttl pinger stopped");
                    return;
                }
                _ = sleep(self.interval) => {
                    match self.client.update_ttl(&self.check_id, "ttl check passing").await {
                        Ok(()) => {
                            counter!("heartbeat_pings_total", "result" => "ok").increment(1);
                        }
                        Err(err) => {
                            counter!("heartbeat_pings_total", "result" => "error").increment(1);
                            warn!(%err, check_id = %self.check_id, "ttl update failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::client::KeyValue;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Register(ServiceRegistration),
        Deregister(String),
        UpdateTtl(String),
    }

    struct RecordingClient {
        calls: Mutex<Vec<Call>>,
        fail_register: bool,
        fail_ttl: bool,
    }

    impl RecordingClient {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_register: false,
                fail_ttl: false,
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CoordinationClient for RecordingClient {
        async fn get_key(&self, _path: &str) -> Result<Option<KeyValue>, TransportError> {
            unimplemented!()
        }

        async fn watch_key(
            &self,
            _path: &str,
            _cursor: u64,
            _wait: Duration,
        ) -> Result<Option<KeyValue>, TransportError> {
            unimplemented!()
        }

        async fn register_service(
            &self,
            registration: &ServiceRegistration,
        ) -> Result<(), TransportError> {
            if self.fail_register {
                return Err(TransportError::Request("agent down".to_string()));
            }
            self.calls
                .lock()
                .unwrap()
                .push(Call::Register(registration.clone()));
            Ok(())
        }

        async fn deregister_service(&self, instance_id: &str) -> Result<(), TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Deregister(instance_id.to_string()));
            Ok(())
        }

        async fn update_ttl(&self, check_id: &str, _note: &str) -> Result<(), TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::UpdateTtl(check_id.to_string()));
            if self.fail_ttl {
                return Err(TransportError::Request("agent down".to_string()));
            }
            Ok(())
        }
    }

    fn instance() -> RegisteredInstance {
        let app = AppInfo::new("svc", "1.0.0", "dev", "10.0.0.7");
        RegisteredInstance::from_identity(&app, 8080, "http")
    }

    #[test]
    fn instance_derives_catalog_identity() {
        let inst = instance();
        assert_eq!(inst.name, "svc-1.0.0");
        assert_eq!(inst.host, "10.0.0.7");
        assert_eq!(inst.port, 8080);
        assert_eq!(inst.check_id(), format!("service:{}", inst.id));
    }

    #[tokio::test]
    async fn register_submits_ttl_checked_entry() {
        let client = Arc::new(RecordingClient::new());
        let registrar = ServiceRegistrar::new(Arc::clone(&client), instance());

        registrar.register().await.expect("register succeeds");
        assert!(registrar.is_registered());

        let calls = client.calls();
        assert_eq!(calls.len(), 1);
        let Call::Register(reg) = &calls[0] else {
            panic!("expected a register call");
        };
        assert_eq!(reg.check.ttl, TTL_DURATION);
        assert_eq!(reg.check.deregister_critical_service_after, DEREGISTER_AFTER);
        assert!(reg.tags.contains(&"ttl".to_string()));
    }

    #[tokio::test]
    async fn register_failure_leaves_registrar_inactive() {
        let mut client = RecordingClient::new();
        client.fail_register = true;
        let registrar = ServiceRegistrar::new(Arc::new(client), instance());

        assert!(matches!(
            registrar.register().await.unwrap_err(),
            RegistryError::RegistrationFailed { .. }
        ));
        assert!(!registrar.is_registered());
        assert!(registrar.heartbeat().is_none());
    }

    #[tokio::test]
    async fn deregister_without_registration_issues_no_call() {
        let client = Arc::new(RecordingClient::new());
        let registrar = ServiceRegistrar::new(Arc::clone(&client), instance());

        registrar.deregister().await.expect("no-op succeeds");
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn deregister_is_idempotent_after_registration() {
        let client = Arc::new(RecordingClient::new());
        let registrar = ServiceRegistrar::new(Arc::clone(&client), instance());
        let id = registrar.instance().id.clone();

        registrar.register().await.expect("register succeeds");
        registrar.deregister().await.expect("deregister succeeds");
        registrar.deregister().await.expect("second call is a no-op");

        let deregisters: Vec<_> = client
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Deregister(_)))
            .collect();
        assert_eq!(deregisters, vec![Call::Deregister(id)]);
        assert!(!registrar.is_registered());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_on_the_interval_and_stops_on_shutdown() {
        let client = Arc::new(RecordingClient::new());
        let registrar = ServiceRegistrar::new(Arc::clone(&client), instance());
        registrar.register().await.expect("register succeeds");

        let pinger = registrar.heartbeat().expect("registered");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(pinger.run(shutdown_rx));

        tokio::time::sleep(PING_INTERVAL * 3 + Duration::from_secs(1)).await;
        let pings = client
            .calls()
            .iter()
            .filter(|call| matches!(call, Call::UpdateTtl(_)))
            .count();
        assert_eq!(pings, 3);

        shutdown_tx.send(true).expect("pinger is subscribed");
        handle.await.expect("pinger exits cleanly");

        // No further pings after cancellation, even with time advancing.
        tokio::time::sleep(PING_INTERVAL * 5).await;
        let after = client
            .calls()
            .iter()
            .filter(|call| matches!(call, Call::UpdateTtl(_)))
            .count();
        assert_eq!(after, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_survives_failed_updates() {
        let mut raw = RecordingClient::new();
        raw.fail_ttl = true;
        let client = Arc::new(raw);
        let registrar = ServiceRegistrar::new(Arc::clone(&client), instance());
        registrar.register().await.expect("register succeeds");

        let pinger = registrar.heartbeat().expect("registered");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(pinger.run(shutdown_rx));

        tokio::time::sleep(PING_INTERVAL * 2 + Duration::from_secs(1)).await;
        let attempts = client
            .calls()
            .iter()
            .filter(|call| matches!(call, Call::UpdateTtl(_)))
            .count();
        assert_eq!(attempts, 2);

        shutdown_tx.send(true).expect("pinger is subscribed");
        handle.await.expect("pinger exits cleanly");
    }

    #[tokio::test]
    async fn heartbeat_targets_the_service_check_id() {
        let client = Arc::new(RecordingClient::new());
        let registrar = ServiceRegistrar::new(Arc::clone(&client), instance());
        registrar.register().await.expect("register succeeds");

        let pinger = registrar.heartbeat().expect("registered");
        assert_eq!(pinger.check_id, registrar.instance().check_id());
    }
}
