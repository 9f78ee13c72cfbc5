use std::{net::SocketAddr, path::Path};

use anyhow::Result;
use figment::{
    providers::{Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Collector roster, as resolved for this deployment. The roster is
    /// installed once at startup; an empty roster is a fatal error.
    pub collectors: Vec<String>,
    /// Path to the allocation config (label_selector + scrape_configs).
    pub allocation_config_path: String,
    /// Seconds between file-sd re-reads.
    pub file_sd_poll_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: "0.0.0.0:3030".to_string(),
            collectors: vec![],
            allocation_config_path: "./conf/targets.yaml".to_string(),
            file_sd_poll_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ServerConfig = Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Yaml::string(&config_str))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "collectors: [\"collector-1\", \"collector-2\"]").unwrap();
        writeln!(file, "listen_addr: \"127.0.0.1:9090\"").unwrap();

        let config = ServerConfig::from_path(&path).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9090");
        assert_eq!(config.collectors.len(), 2);
        // untouched fields keep their defaults
        assert_eq!(config.allocation_config_path, "./conf/targets.yaml");
        assert_eq!(config.file_sd_poll_interval_secs, 30);
    }

    #[test]
    fn test_invalid_listen_addr() {
        let config = ServerConfig {
            listen_addr: "not an address".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
