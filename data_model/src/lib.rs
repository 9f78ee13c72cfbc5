use std::{collections::BTreeMap, fmt::Display};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

pub mod test_objects;

/// Label set attached to a target or a target-group. Kept ordered so two
/// records with the same labels compare and hash identically.
pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct CollectorId(String);

impl Display for CollectorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl CollectorId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

/// One collector instance in the downstream fleet. `num_targets` is derived
/// state: the number of assignment records currently pointing at this
/// collector, recomputable from the assignment table at any time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Collector {
    pub id: CollectorId,
    pub num_targets: usize,
}

impl Collector {
    pub fn new(id: CollectorId) -> Self {
        Self { id, num_targets: 0 }
    }
}

/// A scrape endpoint under one job. Identity for deduplication is
/// `(job_name, url)`; labels are metadata carried alongside and do not
/// participate in identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub job_name: String,
    pub url: String,
    pub labels: Labels,
}

impl Target {
    pub fn key(&self) -> String {
        Target::key_from(&self.job_name, &self.url)
    }

    pub fn key_from(job_name: &str, url: &str) -> String {
        format!("{}|{}", job_name, url)
    }
}

/// A batch of endpoints sharing one label set and one job. This is both the
/// unit providers emit and the shape served on the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetGroup {
    pub targets: Vec<String>,
    #[serde(default)]
    pub labels: Labels,
}

/// Assignment record binding one discovered target to exactly one collector.
/// Records store the collector name, not a handle to the collector itself;
/// collector counts are derived from the assignment table.
#[derive(Debug, Clone, Builder, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetItem {
    pub job_name: String,
    pub target_url: String,
    #[builder(default)]
    pub labels: Labels,
    pub collector_id: CollectorId,
}

impl TargetItem {
    pub fn key(&self) -> String {
        TargetItem::key_from(&self.job_name, &self.target_url)
    }

    pub fn key_from(job_name: &str, target_url: &str) -> String {
        format!("{}|{}", job_name, target_url)
    }

    /// Key of the `(job, collector)` slice this record belongs to in the
    /// read model.
    pub fn job_collector_key(&self) -> String {
        format!("{}|{}", self.job_name, self.collector_id.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_objects::tests::mock_target;

    #[test]
    fn test_target_key() {
        let target = mock_target("node-exporter", "prom.domain:9001");
        assert_eq!(target.key(), "node-exporter|prom.domain:9001");
        assert_eq!(target.key(), Target::key_from("node-exporter", "prom.domain:9001"));
    }

    #[test]
    fn test_target_item_keys() {
        let item = TargetItemBuilder::default()
            .job_name("node-exporter".to_string())
            .target_url("prom.domain:9001".to_string())
            .collector_id(CollectorId::new("collector-1".to_string()))
            .build()
            .unwrap();
        assert_eq!(item.key(), "node-exporter|prom.domain:9001");
        assert_eq!(item.job_collector_key(), "node-exporter|collector-1");
        assert!(item.labels.is_empty());
    }

    #[test]
    fn test_target_group_wire_shape() {
        let group: TargetGroup =
            serde_json::from_str(r#"{"targets": ["prom.domain:9001"]}"#).unwrap();
        assert_eq!(group.targets, vec!["prom.domain:9001".to_string()]);
        assert!(group.labels.is_empty());

        let raw = serde_json::to_string(&group).unwrap();
        assert_eq!(raw, r#"{"targets":["prom.domain:9001"],"labels":{}}"#);
    }
}
