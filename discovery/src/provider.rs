use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use data_model::TargetGroup;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Protocol between providers and the consolidation loop.
pub(crate) enum DiscoveryEvent {
    /// A new provider set replaced the old one. Emissions from earlier
    /// generations are dropped on the floor.
    Reset {
        generation: u64,
        provider_count: usize,
    },
    Update(ProviderUpdate),
}

/// One provider's most recent batch of target-groups. Replaces the
/// provider's previous batch wholesale.
pub(crate) struct ProviderUpdate {
    pub generation: u64,
    pub provider_id: usize,
    pub job_name: String,
    pub groups: Vec<TargetGroup>,
}

pub(crate) type EventSender = mpsc::UnboundedSender<DiscoveryEvent>;

/// Provider for an inline static_configs entry: emits its target-group once
/// at start and never again.
pub(crate) struct StaticProvider {
    pub generation: u64,
    pub provider_id: usize,
    pub job_name: String,
    pub groups: Vec<TargetGroup>,
}

impl StaticProvider {
    pub(crate) fn start(self, events: &EventSender) {
        debug!(job = %self.job_name, "static provider emitting initial target group");
        let _ = events.send(DiscoveryEvent::Update(ProviderUpdate {
            generation: self.generation,
            provider_id: self.provider_id,
            job_name: self.job_name,
            groups: self.groups,
        }));
    }
}

/// Provider for a file_sd_configs entry: re-reads the watched files on an
/// interval and emits their union whenever the parsed content changed.
/// Unreadable or malformed files are logged and skipped for that pass.
pub(crate) struct FileProvider {
    pub generation: u64,
    pub provider_id: usize,
    pub job_name: String,
    pub files: Vec<PathBuf>,
    pub poll_interval: Duration,
    pub events: EventSender,
    pub shutdown_rx: watch::Receiver<()>,
}

impl FileProvider {
    pub(crate) fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(mut self) {
        let mut last: Option<Vec<TargetGroup>> = None;
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let groups = self.read_groups().await;
                    if last.as_ref() == Some(&groups) {
                        continue;
                    }
                    debug!(
                        job = %self.job_name,
                        groups = groups.len(),
                        "file provider emitting re-read target groups"
                    );
                    let update = ProviderUpdate {
                        generation: self.generation,
                        provider_id: self.provider_id,
                        job_name: self.job_name.clone(),
                        groups: groups.clone(),
                    };
                    if self.events.send(DiscoveryEvent::Update(update)).is_err() {
                        break;
                    }
                    last = Some(groups);
                }
                _ = self.shutdown_rx.changed() => {
                    debug!(job = %self.job_name, "file provider shutting down");
                    break;
                }
            }
        }
    }

    async fn read_groups(&self) -> Vec<TargetGroup> {
        let mut groups = Vec::new();
        for path in &self.files {
            match read_sd_file(path).await {
                Ok(mut parsed) => groups.append(&mut parsed),
                Err(err) => {
                    warn!(
                        job = %self.job_name,
                        file = %path.display(),
                        "skipping file-sd file: {:?}",
                        err
                    );
                }
            }
        }
        groups
    }
}

/// Parses one file-sd file: a JSON or YAML array of
/// `{targets: [...], labels: {...}}` records.
async fn read_sd_file(path: &Path) -> Result<Vec<TargetGroup>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .context("reading file-sd file")?;
    let groups = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&raw).context("parsing file-sd json")?,
        _ => serde_yaml::from_str(&raw).context("parsing file-sd yaml")?,
    };
    Ok(groups)
}
