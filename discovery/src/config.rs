use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use data_model::Labels;

/// Allocation config handed to `DiscoveryManager::apply_config`.
///
/// `label_selector` is consumed by the deployment platform to resolve the
/// collector roster; the core carries it through unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocatorConfig {
    #[serde(default)]
    pub label_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub config: ScrapeConfigs,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapeConfigs {
    #[serde(default)]
    pub scrape_configs: Vec<ScrapeConfig>,
}

/// One named scrape configuration. Each `static_configs` entry and each
/// `file_sd_configs` entry becomes one provider under this job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapeConfig {
    pub job_name: String,
    #[serde(default)]
    pub static_configs: Vec<StaticScrapeConfig>,
    #[serde(default)]
    pub file_sd_configs: Vec<FileSdConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticScrapeConfig {
    pub targets: Vec<String>,
    #[serde(default)]
    pub labels: Labels,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSdConfig {
    pub files: Vec<PathBuf>,
}

impl AllocatorConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<AllocatorConfig> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading allocation config {}", path.display()))?;
        let config: AllocatorConfig =
            serde_yaml::from_str(&raw).context("malformed allocation config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for scrape_config in &self.config.scrape_configs {
            if scrape_config.job_name.is_empty() {
                bail!("scrape config with empty job_name");
            }
            for file_sd in &scrape_config.file_sd_configs {
                if file_sd.files.is_empty() {
                    bail!(
                        "file_sd_config for job {} lists no files",
                        scrape_config.job_name
                    );
                }
            }
        }
        Ok(())
    }
}
