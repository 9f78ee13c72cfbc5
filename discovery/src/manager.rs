use std::{
    collections::{BTreeMap, HashSet},
    time::Duration,
};

use anyhow::{anyhow, Result};
use data_model::{Target, TargetGroup};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::{
    config::AllocatorConfig,
    provider::{DiscoveryEvent, FileProvider, StaticProvider},
};

pub const DEFAULT_FILE_SD_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Aggregates the emissions of all configured providers into one flat,
/// deduplicated target list and publishes each consolidated snapshot to the
/// subscriber.
///
/// Consolidation is serialized through a single loop, and delivery goes
/// through a one-slot mailbox whose producer overwrites: a slow subscriber
/// always reads the most recent snapshot and intermediate ones are
/// discarded.
pub struct DiscoveryManager {
    events_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    snapshot_tx: watch::Sender<Vec<Target>>,
    providers: Mutex<ProviderSet>,
    consolidation: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<()>,
    file_sd_poll_interval: Duration,
}

struct ProviderSet {
    generation: u64,
    shutdown_tx: Option<watch::Sender<()>>,
}

impl DiscoveryManager {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(Vec::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let consolidation = tokio::spawn(run_consolidation(
            events_rx,
            snapshot_tx.clone(),
            shutdown_rx,
        ));
        Self {
            events_tx,
            snapshot_tx,
            providers: Mutex::new(ProviderSet {
                generation: 0,
                shutdown_tx: None,
            }),
            consolidation: Mutex::new(Some(consolidation)),
            shutdown_tx,
            file_sd_poll_interval: DEFAULT_FILE_SD_POLL_INTERVAL,
        }
    }

    pub fn with_file_sd_poll_interval(mut self, interval: Duration) -> Self {
        self.file_sd_poll_interval = interval;
        self
    }

    /// Atomically replaces the running provider set with one derived from
    /// the given config. Returns once the new providers are constructed;
    /// their initial emissions arrive asynchronously.
    pub async fn apply_config(&self, config: &AllocatorConfig) -> Result<()> {
        config.validate()?;

        let mut providers = self.providers.lock().await;
        if let Some(shutdown) = providers.shutdown_tx.take() {
            let _ = shutdown.send(());
        }
        providers.generation += 1;
        let generation = providers.generation;

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let mut static_providers = Vec::new();
        let mut file_providers = Vec::new();
        let mut provider_id = 0;
        for scrape_config in &config.config.scrape_configs {
            for static_config in &scrape_config.static_configs {
                static_providers.push(StaticProvider {
                    generation,
                    provider_id,
                    job_name: scrape_config.job_name.clone(),
                    groups: vec![TargetGroup {
                        targets: static_config.targets.clone(),
                        labels: static_config.labels.clone(),
                    }],
                });
                provider_id += 1;
            }
            for file_sd in &scrape_config.file_sd_configs {
                file_providers.push(FileProvider {
                    generation,
                    provider_id,
                    job_name: scrape_config.job_name.clone(),
                    files: file_sd.files.clone(),
                    poll_interval: self.file_sd_poll_interval,
                    events: self.events_tx.clone(),
                    shutdown_rx: shutdown_rx.clone(),
                });
                provider_id += 1;
            }
        }

        self.events_tx
            .send(DiscoveryEvent::Reset {
                generation,
                provider_count: provider_id,
            })
            .map_err(|_| anyhow!("discovery manager is closed"))?;

        for provider in static_providers {
            provider.start(&self.events_tx);
        }
        for provider in file_providers {
            provider.spawn();
        }

        providers.shutdown_tx = Some(shutdown_tx);
        info!(
            generation,
            providers = provider_id,
            "applied scrape configuration"
        );
        Ok(())
    }

    /// Returns the snapshot mailbox the consolidated target list is
    /// published to. The core registers a single subscriber, once.
    pub fn watch(&self) -> watch::Receiver<Vec<Target>> {
        self.snapshot_tx.subscribe()
    }

    /// Stops all providers and the consolidation loop, draining any
    /// in-flight emission. Idempotent.
    pub async fn close(&self) {
        {
            let mut providers = self.providers.lock().await;
            if let Some(shutdown) = providers.shutdown_tx.take() {
                let _ = shutdown.send(());
            }
            let _ = self.shutdown_tx.send(());
        }
        if let Some(handle) = self.consolidation.lock().await.take() {
            let _ = handle.await;
        }
    }
}

impl Default for DiscoveryManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_consolidation(
    mut events_rx: mpsc::UnboundedReceiver<DiscoveryEvent>,
    snapshot_tx: watch::Sender<Vec<Target>>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    // provider slot -> (job, most recent batch); slots are numbered in
    // config order, so deduplication keeps the first occurrence
    // deterministically
    let mut generation = 0u64;
    let mut groups_by_provider: BTreeMap<usize, (String, Vec<TargetGroup>)> = BTreeMap::new();
    loop {
        tokio::select! {
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    DiscoveryEvent::Reset { generation: next, provider_count } => {
                        generation = next;
                        groups_by_provider.clear();
                        if provider_count == 0 {
                            snapshot_tx.send_replace(Vec::new());
                        }
                    }
                    DiscoveryEvent::Update(update) => {
                        if update.generation != generation {
                            debug!(
                                job = %update.job_name,
                                "dropping emission from a stopped provider set"
                            );
                            continue;
                        }
                        groups_by_provider
                            .insert(update.provider_id, (update.job_name, update.groups));
                        snapshot_tx.send_replace(flatten(&groups_by_provider));
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                debug!("consolidation loop shutting down");
                break;
            }
        }
    }
}

/// Flattens every provider's current groups into one target list,
/// deduplicated by `(job, endpoint)` keeping the first occurrence.
fn flatten(groups_by_provider: &BTreeMap<usize, (String, Vec<TargetGroup>)>) -> Vec<Target> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut flat = Vec::new();
    for (job_name, groups) in groups_by_provider.values() {
        for group in groups {
            for url in &group.targets {
                if seen.insert(Target::key_from(job_name, url)) {
                    flat.push(Target {
                        job_name: job_name.clone(),
                        url: url.clone(),
                        labels: group.labels.clone(),
                    });
                }
            }
        }
    }
    flat
}
