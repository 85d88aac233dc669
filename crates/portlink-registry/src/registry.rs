//! The link registry: owns every configured link, mediates lifecycle
//! operations, and produces status snapshots for observers.

use std::sync::Arc;
use std::time::Duration;

use portlink_config::LinkConfig;
use portlink_link::LinkInstance;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::store::LinkStore;
use crate::RegistryError;

/// Whether a link currently has a running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Linked,
    Unlinked,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Linked => f.write_str("linked"),
            LinkState::Unlinked => f.write_str("unlinked"),
        }
    }
}

/// One row of a registry snapshot.
#[derive(Debug, Clone)]
pub struct LinkStatus {
    pub index: usize,
    pub bind: String,
    pub mode: String,
    /// Active proxied connections; 0 when the link is stopped.
    pub channels: usize,
    /// Bytes relayed since the previous snapshot.
    pub throughput: u64,
    pub state: LinkState,
}

/// Runtime record for one configured link.
struct LinkEntry {
    config: LinkConfig,
    bind: String,
    /// Cumulative flow at the previous snapshot, for rate computation.
    last_flow: u64,
    /// Present while the link is running.
    instance: Option<LinkInstance>,
}

/// Registry of configured links. All operations serialize on one
/// registry-wide lock; instance internals are never touched directly.
pub struct LinkRegistry {
    links: Arc<RwLock<Vec<LinkEntry>>>,
    store: Arc<dyn LinkStore>,
    snapshot_tx: watch::Sender<Vec<LinkStatus>>,
    monitor: std::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl LinkRegistry {
    pub fn new(store: Arc<dyn LinkStore>) -> Self {
        let (snapshot_tx, _) = watch::channel(Vec::new());
        Self {
            links: Arc::new(RwLock::new(Vec::new())),
            store,
            snapshot_tx,
            monitor: std::sync::Mutex::new(None),
        }
    }

    /// Replay the stored configuration through the normal construction
    /// path. Configs that no longer bind are dropped with a logged
    /// error; reload problems never abort startup.
    pub async fn load_from_store(&self) {
        let configs = match self.store.load() {
            Ok(configs) => configs,
            Err(err) => {
                error!(error = %err, "failed to load stored link configuration");
                return;
            }
        };

        for config in configs {
            let bind = config.bind();
            if let Err(err) = self.insert_link(config, false).await {
                error!(bind = %bind, error = %err, "dropping stored link");
            }
        }
    }

    /// Add a link and start it. On any failure the registry is unchanged.
    pub async fn add_link(&self, config: LinkConfig) -> Result<(), RegistryError> {
        self.insert_link(config, true).await
    }

    async fn insert_link(&self, config: LinkConfig, persist: bool) -> Result<(), RegistryError> {
        let bind = config.bind();
        let mut links = self.links.write().await;

        if links.iter().any(|entry| entry.bind == bind) {
            return Err(RegistryError::DuplicateBind(bind));
        }

        let instance = LinkInstance::start(config.clone()).await?;
        info!(bind = %bind, mode = %config.mode, "link added");

        links.push(LinkEntry {
            config,
            bind,
            last_flow: 0,
            instance: Some(instance),
        });

        if persist {
            self.persist(&links);
        }
        Ok(())
    }

    /// Remove the given binds, force-closing any running instances.
    /// Unknown binds are silently skipped.
    pub async fn remove_links(&self, binds: &[String]) {
        let mut links = self.links.write().await;

        for bind in binds {
            let Some(position) = links.iter().position(|entry| &entry.bind == bind) else {
                continue;
            };
            let entry = links.remove(position);
            if let Some(instance) = entry.instance {
                instance.close().await;
            }
            info!(bind = %bind, "link removed");
        }

        self.persist(&links);
    }

    /// Start stopped links. Already-running links are untouched; start
    /// failures are logged and leave the record stopped.
    pub async fn start_links(&self, binds: &[String]) {
        let mut links = self.links.write().await;

        for bind in binds {
            let Some(entry) = links.iter_mut().find(|entry| &entry.bind == bind) else {
                continue;
            };
            if entry.instance.is_some() {
                continue;
            }
            match LinkInstance::start(entry.config.clone()).await {
                Ok(instance) => {
                    entry.instance = Some(instance);
                    info!(bind = %bind, "link started");
                }
                Err(err) => warn!(bind = %bind, error = %err, "link start failed"),
            }
        }
    }

    /// Stop running links, keeping their configuration.
    pub async fn stop_links(&self, binds: &[String]) {
        let mut links = self.links.write().await;

        for bind in binds {
            let Some(entry) = links.iter_mut().find(|entry| &entry.bind == bind) else {
                continue;
            };
            if let Some(instance) = entry.instance.take() {
                instance.close().await;
                info!(bind = %bind, "link stopped");
            }
        }
    }

    /// Configuration lookup by bind string.
    pub async fn find_link(&self, bind: &str) -> Option<LinkConfig> {
        let links = self.links.read().await;
        links
            .iter()
            .find(|entry| entry.bind == bind)
            .map(|entry| entry.config.clone())
    }

    /// Status of every configured link. Throughput is the flow delta
    /// since the previous snapshot, so snapshot cadence defines the
    /// rate interval.
    pub async fn snapshot(&self) -> Vec<LinkStatus> {
        compute_snapshot(&self.links).await
    }

    /// Latest snapshot published by the monitor task.
    pub fn subscribe(&self) -> watch::Receiver<Vec<LinkStatus>> {
        self.snapshot_tx.subscribe()
    }

    /// Start the periodic snapshot monitor. A second call is a no-op;
    /// the task stops when [`shutdown`](Self::shutdown) runs.
    pub fn start_monitor(&self, interval: Duration) {
        let mut monitor = self.monitor.lock().unwrap();
        if monitor.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let links = self.links.clone();
        let snapshot_tx = self.snapshot_tx.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = compute_snapshot(&links).await;
                        let _ = snapshot_tx.send(snapshot);
                    }
                }
            }
        });

        *monitor = Some((cancel, task));
    }

    /// Stop the monitor and close every running link. The registry can
    /// be reused afterwards, but is normally dropped.
    pub async fn shutdown(&self) {
        let monitor = self.monitor.lock().unwrap().take();
        if let Some((cancel, task)) = monitor {
            cancel.cancel();
            let _ = task.await;
        }

        let mut links = self.links.write().await;
        for entry in links.iter_mut() {
            if let Some(instance) = entry.instance.take() {
                instance.close().await;
            }
        }
        info!("registry shut down");
    }

    fn persist(&self, links: &[LinkEntry]) {
        let configs: Vec<LinkConfig> = links.iter().map(|entry| entry.config.clone()).collect();
        if let Err(err) = self.store.save(&configs) {
            error!(error = %err, "failed to persist link configuration");
        }
    }
}

/// Shared by [`LinkRegistry::snapshot`] and the monitor task, which holds
/// its own handle on the links list rather than the whole registry.
async fn compute_snapshot(links: &RwLock<Vec<LinkEntry>>) -> Vec<LinkStatus> {
    let mut links = links.write().await;

    links
        .iter_mut()
        .enumerate()
        .map(|(index, entry)| {
            let (channels, throughput, state) = match &entry.instance {
                Some(instance) => {
                    let flow = instance.total_flow();
                    let delta = flow.saturating_sub(entry.last_flow);
                    entry.last_flow = flow;
                    (instance.channel_count(), delta, LinkState::Linked)
                }
                None => (0, 0, LinkState::Unlinked),
            };
            LinkStatus {
                index,
                bind: entry.bind.clone(),
                mode: entry.config.mode.to_string(),
                channels,
                throughput,
                state,
            }
        })
        .collect()
}
