//! Long-poll watch loop that keeps the configuration current.

use std::{sync::Arc, time::Duration};

use metrics::{counter, gauge};
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::{debug, info, warn};

use waypost_domain::config::BootstrapConfig;

use crate::client::{CoordinationClient, KeyValue};
use crate::loader::{decode_blob, ConfigError};

/// Server-side wait for each long-poll iteration.
pub const WATCH_WAIT: Duration = Duration::from_secs(60);

/// Pause before retrying after a transport error.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Background watcher for the configuration key.
///
/// The loop runs for the life of the process: transport errors are retried
/// after a fixed backoff without advancing the cursor, and a response is
/// only delivered to the callback when its version strictly advances. The
/// callback is invoked from the single watcher task, so reloads are applied
/// sequentially in increasing version order.
pub struct ConfigWatcher<C> {
    client: Arc<C>,
    key_path: String,
    cursor: u64,
    primed: bool,
}

impl<C: CoordinationClient + 'static> ConfigWatcher<C> {
    /// Callers normally pass a `cursor` of zero: the first long-poll then
    /// returns the key's current value immediately, which seeds the cursor
    /// without firing the callback. With a non-zero cursor the first
    /// response still only seeds the baseline, so a change it carries
    /// would be absorbed silently.
    pub fn new(client: Arc<C>, key_path: impl Into<String>, cursor: u64) -> Self {
        Self {
            client,
            key_path: key_path.into(),
            cursor,
            primed: false,
        }
    }

    /// Spawns the supervised watch task. It exits only when `shutdown`
    /// fires (or its sender is dropped), abandoning any in-flight call.
    pub fn spawn<F>(self, shutdown: watch::Receiver<bool>, on_change: F) -> JoinHandle<()>
    where
        F: FnMut(BootstrapConfig) + Send + 'static,
    {
        tokio::spawn(self.run(shutdown, on_change))
    }

    async fn run<F>(mut self, mut shutdown: watch::Receiver<bool>, mut on_change: F)
    where
        F: FnMut(BootstrapConfig) + Send,
    {
        info!(key = %self.key_path, cursor = self.cursor, "starting configuration watch");

        loop {
            let outcome = tokio::select! {
                _ = shutdown.changed() => break,
                outcome = self.client.watch_key(&self.key_path, self.cursor, WATCH_WAIT) => outcome,
            };

            match outcome {
                Err(err) => {
                    warn!(%err, key = %self.key_path, "configuration watch failed, backing off");
                    counter!("config_watch_errors_total").increment(1);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = sleep(RETRY_BACKOFF) => {}
                    }
                }
                // Key absent or the wait elapsed without a change.
                Ok(None) => {}
                Ok(Some(kv)) => self.observe(kv, &mut on_change),
            }
        }

        debug!(key = %self.key_path, "configuration watch stopped");
    }

    fn observe<F>(&mut self, kv: KeyValue, on_change: &mut F)
    where
        F: FnMut(BootstrapConfig),
    {
        let advanced = kv.version > self.cursor;
        if advanced {
            self.cursor = kv.version;
        }

        // The first response mirrors the value the initial load already
        // delivered; it only seeds the cursor.
        if !self.primed {
            self.primed = true;
            return;
        }
        if !advanced {
            return;
        }

        match decode_reload(&kv.value) {
            Ok(config) => {
                counter!("config_reloads_total", "result" => "applied").increment(1);
                gauge!("config_version").set(self.cursor as f64);
                info!(key = %self.key_path, version = self.cursor, "configuration reloaded");
                on_change(config);
            }
            Err(err) => {
                // The bad value is discarded; the previous config stays in
                // effect. The cursor has already advanced, so the next poll
                // waits for a newer version instead of re-reading this one.
                counter!("config_reloads_total", "result" => "discarded").increment(1);
                warn!(%err, key = %self.key_path, version = self.cursor,
                    "discarding invalid configuration update");
            }
        }
    }
}

/// Reloads go through the same decode and structural validation as the
/// first load, so a partial server-pushed update can never replace a
/// complete configuration.
fn decode_reload(raw: &[u8]) -> Result<BootstrapConfig, ConfigError> {
    let config = decode_blob(raw)?;
    config
        .validate()
        .map_err(|section| ConfigError::Invalid { section })?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    use crate::client::{ServiceRegistration, TransportError};

    fn blob(marker: &str) -> String {
        format!(
            r#"
server:
  http:
    addr: {marker}
data:
  database:
    driver: postgres
auth:
  endpoint: http://auth.internal:9000
trace:
  endpoint: http://otel.internal:4317
discovery:
  consul:
    addr: consul.internal:8500
"#
        )
    }

    fn kv(marker: &str, version: u64) -> Result<Option<KeyValue>, TransportError> {
        Ok(Some(KeyValue {
            value: blob(marker).into_bytes(),
            version,
        }))
    }

    fn raw(value: &str, version: u64) -> Result<Option<KeyValue>, TransportError> {
        Ok(Some(KeyValue {
            value: value.as_bytes().to_vec(),
            version,
        }))
    }

    /// Replays a scripted sequence of long-poll responses, then parks
    /// forever so the watcher blocks like it would against a quiet server.
    struct ScriptedClient {
        responses: Mutex<Vec<Result<Option<KeyValue>, TransportError>>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<Option<KeyValue>, TransportError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl CoordinationClient for ScriptedClient {
        async fn get_key(&self, _path: &str) -> Result<Option<KeyValue>, TransportError> {
            unimplemented!("watcher never issues one-shot reads")
        }

        async fn watch_key(
            &self,
            _path: &str,
            _cursor: u64,
            _wait: Duration,
        ) -> Result<Option<KeyValue>, TransportError> {
            let next = {
                let mut responses = self.responses.lock().unwrap();
                if responses.is_empty() {
                    None
                } else {
                    Some(responses.remove(0))
                }
            };
            match next {
                Some(response) => response,
                None => std::future::pending().await,
            }
        }

        async fn register_service(
            &self,
            _registration: &ServiceRegistration,
        ) -> Result<(), TransportError> {
            unimplemented!()
        }

        async fn deregister_service(&self, _instance_id: &str) -> Result<(), TransportError> {
            unimplemented!()
        }

        async fn update_ttl(&self, _check_id: &str, _note: &str) -> Result<(), TransportError> {
            unimplemented!()
        }
    }

    async fn collect_changes(
        responses: Vec<Result<Option<KeyValue>, TransportError>>,
        cursor: u64,
        expected: usize,
    ) -> Vec<String> {
        let client = Arc::new(ScriptedClient::new(responses));
        let watcher = ConfigWatcher::new(client, "configs/config.yaml", cursor);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (changes_tx, mut changes_rx) = mpsc::unbounded_channel();

        let handle = watcher.spawn(shutdown_rx, move |config| {
            let addr = config.server_addr().unwrap_or_default().to_string();
            let _ = changes_tx.send(addr);
        });

        let mut received = Vec::new();
        for _ in 0..expected {
            let next = tokio::time::timeout(Duration::from_secs(300), changes_rx.recv())
                .await
                .expect("expected a reload before the deadline")
                .expect("watcher still running");
            received.push(next);
        }

        // No further reloads should arrive once the script is exhausted.
        let extra = tokio::time::timeout(Duration::from_secs(300), changes_rx.recv()).await;
        assert!(extra.is_err(), "unexpected extra reload: {extra:?}");

        shutdown_tx.send(true).expect("watcher is subscribed");
        handle.await.expect("watcher exits cleanly");
        received
    }

    #[tokio::test(start_paused = true)]
    async fn fires_only_when_the_version_advances() {
        // Versions [2, 2, 5, 5, 7] against an initial cursor of 1: the
        // first response seeds the cursor, repeats are no-ops, so exactly
        // two reloads fire (5 and 7).
        let received = collect_changes(
            vec![
                kv("addr-2", 2),
                kv("addr-2", 2),
                kv("addr-5", 5),
                kv("addr-5", 5),
                kv("addr-7", 7),
            ],
            1,
            2,
        )
        .await;
        assert_eq!(received, vec!["addr-5".to_string(), "addr-7".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn change_landing_in_the_first_watch_window_is_applied() {
        // The key sits at version 12 when the watcher starts from cursor
        // zero; a write to version 13 arrives as the first poll response.
        // The baseline mirrors the current value, so the change must fire.
        let received =
            collect_changes(vec![kv("addr-12", 12), kv("addr-13", 13)], 0, 1).await;
        assert_eq!(received, vec!["addr-13".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn survives_transport_errors_without_losing_changes() {
        let received = collect_changes(
            vec![
                Err(TransportError::Request("connection reset".to_string())),
                kv("addr-2", 2),
                Err(TransportError::Request("connection reset".to_string())),
                kv("addr-5", 5),
            ],
            0,
            1,
        )
        .await;
        assert_eq!(received, vec!["addr-5".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn discards_undecodable_updates_and_recovers() {
        let received = collect_changes(
            vec![
                kv("addr-2", 2),
                raw("server: [unbalanced", 5),
                kv("addr-7", 7),
            ],
            0,
            1,
        )
        .await;
        assert_eq!(received, vec!["addr-7".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn discards_structurally_incomplete_updates() {
        let received = collect_changes(
            vec![
                kv("addr-2", 2),
                raw("server:\n  http:\n    addr: partial\n", 5),
                kv("addr-7", 7),
            ],
            0,
            1,
        )
        .await;
        assert_eq!(received, vec!["addr-7".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_polls_are_not_changes() {
        let received = collect_changes(vec![kv("addr-2", 2), Ok(None), kv("addr-5", 5)], 0, 1).await;
        assert_eq!(received, vec!["addr-5".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_an_in_flight_poll() {
        let client = Arc::new(ScriptedClient::new(Vec::new()));
        let watcher = ConfigWatcher::new(client, "configs/config.yaml", 0);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = watcher.spawn(shutdown_rx, |_| {});
        shutdown_tx.send(true).expect("watcher is subscribed");

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("watcher exits promptly")
            .expect("watcher task succeeds");
    }
}
