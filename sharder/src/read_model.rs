use std::collections::{BTreeMap, HashMap};

use data_model::{Labels, TargetGroup, TargetItem};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Relative link wrapper, serialized as `{"_link": ...}` on the HTTP
/// surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkLabel {
    #[serde(rename = "_link")]
    pub link: String,
}

/// One collector's slice of a job: the link collectors pull from and the
/// job's records for that collector, grouped by identical label set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectorTargets {
    #[serde(rename = "_link")]
    pub link: String,
    pub targets: Vec<TargetGroup>,
}

/// The three precomputed response shapes served over HTTP.
#[derive(Debug, Clone, Default)]
pub struct ReadModel {
    /// jobName -> relative link to the job's targets.
    pub jobs: HashMap<String, LinkLabel>,
    /// jobName -> collectorName -> link + groups.
    pub collectors_by_job: HashMap<String, HashMap<String, CollectorTargets>>,
    /// jobName|collectorName -> groups.
    pub groups_by_job_collector: HashMap<String, Vec<TargetGroup>>,
}

/// Derives the read model from the assignment table. Rebuilt from scratch
/// after every reshard and swapped in under the sharder's write lock, so
/// readers never observe a half-built model.
pub fn build_read_model(target_items: &im::HashMap<String, Box<TargetItem>>) -> ReadModel {
    // (job, collector) -> label set -> endpoints carrying that label set
    let mut buckets: HashMap<(String, String), BTreeMap<Labels, Vec<String>>> = HashMap::new();
    for item in target_items.values() {
        buckets
            .entry((item.job_name.clone(), item.collector_id.get().to_string()))
            .or_default()
            .entry(item.labels.clone())
            .or_default()
            .push(item.target_url.clone());
    }

    let mut model = ReadModel::default();
    for ((job_name, collector_name), by_labels) in buckets {
        let groups = by_labels
            .into_iter()
            .map(|(labels, mut targets)| {
                targets.sort();
                TargetGroup { targets, labels }
            })
            .collect_vec();

        model.jobs.insert(
            job_name.clone(),
            LinkLabel {
                link: format!("/jobs/{}/targets", job_name),
            },
        );
        model
            .collectors_by_job
            .entry(job_name.clone())
            .or_default()
            .insert(
                collector_name.clone(),
                CollectorTargets {
                    link: format!("/jobs/{}/targets?collector_id={}", job_name, collector_name),
                    targets: groups.clone(),
                },
            );
        model
            .groups_by_job_collector
            .insert(format!("{}|{}", job_name, collector_name), groups);
    }
    model
}
