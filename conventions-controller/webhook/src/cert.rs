//! Serving-certificate hot reload.
//!
//! The key pair is refreshed on a five-minute timer and whenever the mount
//! directory changes on disk, so certificate rotation never requires a
//! restart. Readers always observe a complete, consistent server config.

use anyhow::{Context as _, Result};
use notify::Watcher as _;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct CertWatcher {
    crt: PathBuf,
    key: PathBuf,
    config: Mutex<Option<Arc<rustls::ServerConfig>>>,
}

// === impl CertWatcher ===

impl CertWatcher {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            crt: dir.join("tls.crt"),
            key: dir.join("tls.key"),
            config: Mutex::new(None),
        }
    }

    /// Loads the key pair from disk and swaps in a fresh server config.
    pub fn load(&self) -> Result<()> {
        let certs = {
            let pem = std::fs::read(&self.crt)
                .with_context(|| format!("failed to read {}", self.crt.display()))?;
            rustls_pemfile::certs(&mut pem.as_slice())
                .collect::<Result<Vec<_>, _>>()
                .context("failed to parse certificate chain")?
        };
        let key = {
            let pem = std::fs::read(&self.key)
                .with_context(|| format!("failed to read {}", self.key.display()))?;
            rustls_pemfile::private_key(&mut pem.as_slice())
                .context("failed to parse private key")?
                .context("no private key found")?
        };

        let config =
            rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .context("invalid TLS key pair")?;

        *self.config.lock() = Some(Arc::new(config));
        debug!(crt = %self.crt.display(), "Loaded TLS key pair");
        Ok(())
    }

    /// The current server config. [`CertWatcher::load`] must have succeeded
    /// at least once.
    pub fn config(&self) -> Option<Arc<rustls::ServerConfig>> {
        self.config.lock().clone()
    }

    /// Refreshes the key pair periodically and on file-change events until
    /// the stop signal fires.
    pub async fn watch(self: Arc<Self>, mut stop: tokio::sync::watch::Receiver<()>) {
        let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = match notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                if res.is_ok() {
                    let _ = events_tx.send(());
                }
            },
        ) {
            Ok(watcher) => Some(watcher),
            Err(error) => {
                warn!(%error, "Failed to initialize file watcher, relying on periodic refresh");
                None
            }
        };
        if let (Some(watcher), Some(dir)) = (watcher.as_mut(), self.crt.parent()) {
            if let Err(error) = watcher.watch(dir, notify::RecursiveMode::NonRecursive) {
                warn!(%error, "Failed to watch certificate directory");
            }
        }

        // Refresh the certs periodically even if we miss a fs event.
        let mut interval = tokio::time::interval(REFRESH_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                event = events_rx.recv() => {
                    if event.is_none() {
                        return;
                    }
                }
                _ = stop.changed() => return,
            }
            if let Err(error) = self.load() {
                warn!(%error, "Failed to reload TLS key pair");
            }
        }
    }
}
