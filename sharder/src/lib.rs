use std::{collections::HashMap, fmt};

use anyhow::{bail, Result};
use data_model::{Collector, CollectorId, Target, TargetGroup, TargetItem, TargetItemBuilder};
use itertools::Itertools;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

pub mod read_model;

use read_model::build_read_model;
pub use read_model::{CollectorTargets, LinkLabel, ReadModel};

/// An assignment that references state outside the installed roster. This is
/// a bug in the sharder rather than a recoverable condition; callers stop
/// resharding on it instead of continuing with a corrupted assignment.
#[derive(Debug)]
pub struct InvariantViolation(String);

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for InvariantViolation {}

/// Distributes discovered scrape targets across the collector fleet.
///
/// Callers stage a consolidated snapshot with `set_targets` and apply it
/// with `reshard`; until then the previous assignment keeps being served.
/// Targets present in consecutive snapshots are never reassigned, so a
/// collector does not lose targets it is already scraping when unrelated
/// targets come and go.
///
/// Roster, assignment table and read model all live behind one read-write
/// lock. `reshard` is the sole writer; HTTP readers take read access.
pub struct TargetSharder {
    state: RwLock<SharderState>,
}

#[derive(Default)]
struct SharderState {
    collectors: im::HashMap<String, Collector>,

    // staged snapshot waiting for the next reshard, keyed by target identity
    staged: HashMap<String, Target>,

    // jobName|url -> assignment record
    target_items: im::HashMap<String, Box<TargetItem>>,

    read_model: ReadModel,
}

// Working copy a reshard builds the next assignment in. Nothing is committed
// until both phases succeed, so a failing phase leaves the served assignment
// and read model untouched and consistent with each other.
#[derive(Debug)]
struct NextAssignment {
    target_items: im::HashMap<String, Box<TargetItem>>,
    collectors: im::HashMap<String, Collector>,
}

impl NextAssignment {
    fn least_loaded_collector(&self) -> Option<CollectorId> {
        self.collectors
            .values()
            .min_by_key(|collector| collector.num_targets)
            .map(|collector| collector.id.clone())
    }
}

impl TargetSharder {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SharderState::default()),
        }
    }

    /// Installs the collector roster. The roster is immutable for the
    /// lifetime of the process, and an empty roster cannot shard anything;
    /// both cases are configuration errors surfaced to the caller.
    pub async fn set_collectors(&self, names: Vec<String>) -> Result<()> {
        if names.is_empty() {
            bail!("no collector instances present");
        }
        let mut state = self.state.write().await;
        if !state.collectors.is_empty() {
            bail!("collector roster is already installed");
        }
        for name in names {
            state
                .collectors
                .insert(name.clone(), Collector::new(CollectorId::new(name)));
        }
        info!(
            collectors = state.collectors.len(),
            "installed collector roster"
        );
        Ok(())
    }

    /// Stages a consolidated snapshot. The assignment is untouched until
    /// `reshard`; successive calls overwrite the buffer, so only the most
    /// recent snapshot is ever applied.
    pub async fn set_targets(&self, targets: Vec<Target>) {
        let staged: HashMap<String, Target> = targets
            .into_iter()
            .map(|target| (target.key(), target))
            .collect();
        self.state.write().await.staged = staged;
    }

    /// Applies the staged snapshot: drops vanished targets, admits new ones
    /// onto the least-loaded collector, and rebuilds the read model. The
    /// next assignment is computed on a working copy and committed only
    /// once both phases succeed; on error the served state is unchanged.
    pub async fn reshard(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let next = state.next_assignment()?;
        state.target_items = next.target_items;
        state.collectors = next.collectors;
        state.read_model = build_read_model(&state.target_items);
        debug!(
            targets = state.target_items.len(),
            "resharded staged snapshot"
        );
        Ok(())
    }

    /// jobName -> relative link, for `GET /jobs`.
    pub async fn job_index(&self) -> HashMap<String, LinkLabel> {
        self.state.read().await.read_model.jobs.clone()
    }

    /// collectorName -> link + groups for one job. Unknown jobs yield an
    /// empty map.
    pub async fn job_collector_index(&self, job_name: &str) -> HashMap<String, CollectorTargets> {
        self.state
            .read()
            .await
            .read_model
            .collectors_by_job
            .get(job_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Groups assigned to one collector under one job. Unknown jobs or
    /// collectors yield an empty list.
    pub async fn collector_groups(
        &self,
        job_name: &str,
        collector_name: &str,
    ) -> Vec<TargetGroup> {
        self.state
            .read()
            .await
            .read_model
            .groups_by_job_collector
            .get(&format!("{}|{}", job_name, collector_name))
            .cloned()
            .unwrap_or_default()
    }

    /// Current number of assigned targets per collector.
    pub async fn collector_counts(&self) -> HashMap<String, usize> {
        let state = self.state.read().await;
        state
            .collectors
            .iter()
            .map(|(name, collector)| (name.clone(), collector.num_targets))
            .collect()
    }

    /// Collector currently holding the given target identity.
    pub async fn assigned_collector(&self, job_name: &str, url: &str) -> Option<CollectorId> {
        let state = self.state.read().await;
        state
            .target_items
            .get(&TargetItem::key_from(job_name, url))
            .map(|item| item.collector_id.clone())
    }

    /// Identity keys of every assignment record.
    pub async fn assignment_keys(&self) -> Vec<String> {
        self.state.read().await.target_items.keys().cloned().collect_vec()
    }
}

impl Default for TargetSharder {
    fn default() -> Self {
        Self::new()
    }
}

impl SharderState {
    /// Computes the assignment the staged snapshot resolves to, without
    /// touching committed state.
    fn next_assignment(&self) -> Result<NextAssignment> {
        let mut next = NextAssignment {
            target_items: self.target_items.clone(),
            collectors: self.collectors.clone(),
        };
        self.remove_outdated_targets(&mut next)?;
        self.process_staged_targets(&mut next)?;
        Ok(next)
    }

    // Drop phase: forget targets absent from the staged snapshot and give
    // their slots back to the owning collectors.
    fn remove_outdated_targets(&self, next: &mut NextAssignment) -> Result<()> {
        let outdated = next
            .target_items
            .keys()
            .filter(|key| !self.staged.contains_key(*key))
            .cloned()
            .collect_vec();
        for key in outdated {
            let Some(item) = next.target_items.remove(&key) else {
                continue;
            };
            match next.collectors.get_mut(item.collector_id.get()) {
                Some(collector) => collector.num_targets -= 1,
                None => {
                    error!(
                        collector_id = item.collector_id.get(),
                        target_key = %key,
                        "assignment references a collector missing from the roster"
                    );
                    return Err(InvariantViolation(format!(
                        "assignment for {} references unknown collector {}",
                        key, item.collector_id
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    // Admit phase: targets already assigned keep their collector, with
    // labels refreshed in place; new identities go to the least-loaded
    // collector.
    fn process_staged_targets(&self, next: &mut NextAssignment) -> Result<()> {
        for (key, target) in &self.staged {
            if let Some(item) = next.target_items.get_mut(key) {
                if item.labels != target.labels {
                    item.labels = target.labels.clone();
                }
                continue;
            }
            let Some(collector_id) = next.least_loaded_collector() else {
                return Err(
                    InvariantViolation("no collector instances present".to_string()).into(),
                );
            };
            if let Some(collector) = next.collectors.get_mut(collector_id.get()) {
                collector.num_targets += 1;
            }
            let item = TargetItemBuilder::default()
                .job_name(target.job_name.clone())
                .target_url(target.url.clone())
                .labels(target.labels.clone())
                .collector_id(collector_id)
                .build()?;
            next.target_items.insert(key.clone(), Box::new(item));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use data_model::test_objects::tests::{
        mock_collector_names, mock_labeled_target, mock_target, TEST_JOB,
    };
    use data_model::Labels;

    use super::*;

    async fn sharder_with(collectors: usize, targets: Vec<Target>) -> TargetSharder {
        let sharder = TargetSharder::new();
        sharder
            .set_collectors(mock_collector_names(collectors))
            .await
            .unwrap();
        sharder.set_targets(targets).await;
        sharder.reshard().await.unwrap();
        sharder
    }

    fn mock_targets(urls: &[&str]) -> Vec<Target> {
        urls.iter().map(|url| mock_target(TEST_JOB, url)).collect()
    }

    fn mock_item(url: &str, collector: &str) -> Box<TargetItem> {
        Box::new(TargetItem {
            job_name: TEST_JOB.to_string(),
            target_url: url.to_string(),
            labels: Labels::new(),
            collector_id: CollectorId::new(collector.to_string()),
        })
    }

    #[tokio::test]
    async fn test_balanced_assignment() {
        let sharder = sharder_with(3, mock_targets(&["a:1", "a:2", "a:3", "a:4"])).await;

        let counts = sharder.collector_counts().await;
        assert_eq!(counts.len(), 3);
        assert_eq!(counts.values().sum::<usize>(), 4);

        let mut sorted = counts.values().copied().collect_vec();
        sorted.sort();
        assert_eq!(sorted, vec![1, 1, 2]);
    }

    #[tokio::test]
    async fn test_assignment_stable_across_reshards() {
        let sharder = sharder_with(3, mock_targets(&["a:1", "a:2", "a:3", "a:4"])).await;

        let mut before = HashMap::new();
        for url in ["a:1", "a:2", "a:3"] {
            before.insert(url, sharder.assigned_collector(TEST_JOB, url).await.unwrap());
        }

        sharder
            .set_targets(mock_targets(&["a:1", "a:2", "a:3", "a:5"]))
            .await;
        sharder.reshard().await.unwrap();

        for url in ["a:1", "a:2", "a:3"] {
            assert_eq!(
                sharder.assigned_collector(TEST_JOB, url).await.unwrap(),
                before[url],
                "target {} moved across reshards",
                url
            );
        }
        assert!(sharder.assigned_collector(TEST_JOB, "a:4").await.is_none());
        assert!(sharder.assigned_collector(TEST_JOB, "a:5").await.is_some());

        // a:5 was admitted to a least-loaded collector, so the balance of
        // the first snapshot is preserved
        let mut sorted = sharder.collector_counts().await.values().copied().collect_vec();
        sorted.sort();
        assert_eq!(sorted, vec![1, 1, 2]);
    }

    #[tokio::test]
    async fn test_new_target_goes_to_least_loaded_collector() {
        let sharder = sharder_with(2, mock_targets(&["a:1", "a:2", "a:3"])).await;

        let counts = sharder.collector_counts().await;
        let least_loaded = counts
            .iter()
            .min_by_key(|(_, count)| **count)
            .map(|(name, _)| name.clone())
            .unwrap();
        assert_eq!(counts[&least_loaded], 1);

        sharder
            .set_targets(mock_targets(&["a:1", "a:2", "a:3", "a:4"]))
            .await;
        sharder.reshard().await.unwrap();

        let assigned = sharder.assigned_collector(TEST_JOB, "a:4").await.unwrap();
        assert_eq!(assigned.get(), least_loaded);

        let mut sorted = sharder.collector_counts().await.values().copied().collect_vec();
        sorted.sort();
        assert_eq!(sorted, vec![2, 2]);
    }

    #[tokio::test]
    async fn test_empty_roster_is_an_error() {
        let sharder = TargetSharder::new();
        let err = sharder.set_collectors(vec![]).await.unwrap_err();
        assert!(err.to_string().contains("no collector instances present"));
    }

    #[tokio::test]
    async fn test_roster_is_immutable() {
        let sharder = TargetSharder::new();
        sharder
            .set_collectors(mock_collector_names(2))
            .await
            .unwrap();
        let err = sharder
            .set_collectors(mock_collector_names(3))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already installed"));
    }

    #[tokio::test]
    async fn test_only_latest_staged_snapshot_applies() {
        let sharder = TargetSharder::new();
        sharder
            .set_collectors(mock_collector_names(2))
            .await
            .unwrap();
        sharder.set_targets(mock_targets(&["a:1", "a:2"])).await;
        sharder.set_targets(mock_targets(&["b:1"])).await;
        sharder.reshard().await.unwrap();

        assert_eq!(
            sharder.assignment_keys().await,
            vec![Target::key_from(TEST_JOB, "b:1")]
        );
    }

    #[tokio::test]
    async fn test_assignment_matches_staged_snapshot() {
        let sharder = sharder_with(3, mock_targets(&["a:1", "a:2", "a:3"])).await;

        sharder.set_targets(mock_targets(&["a:2", "a:3", "a:4"])).await;
        sharder.reshard().await.unwrap();

        let keys: HashSet<String> = sharder.assignment_keys().await.into_iter().collect();
        let expected: HashSet<String> = ["a:2", "a:3", "a:4"]
            .iter()
            .map(|url| Target::key_from(TEST_JOB, url))
            .collect();
        assert_eq!(keys, expected);

        // collector counts agree with the assignment table
        let counts = sharder.collector_counts().await;
        let mut recomputed: HashMap<String, usize> = HashMap::new();
        for url in ["a:2", "a:3", "a:4"] {
            let collector = sharder.assigned_collector(TEST_JOB, url).await.unwrap();
            *recomputed.entry(collector.get().to_string()).or_default() += 1;
        }
        for (name, count) in counts {
            assert_eq!(recomputed.get(&name).copied().unwrap_or(0), count);
        }
    }

    #[tokio::test]
    async fn test_label_refresh_preserves_assignment() {
        let sharder = sharder_with(2, mock_targets(&["a:1"])).await;
        let before = sharder.assigned_collector(TEST_JOB, "a:1").await.unwrap();

        sharder
            .set_targets(vec![mock_labeled_target(TEST_JOB, "a:1", &[("env", "prod")])])
            .await;
        sharder.reshard().await.unwrap();

        let after = sharder.assigned_collector(TEST_JOB, "a:1").await.unwrap();
        assert_eq!(before, after);

        let groups = sharder.collector_groups(TEST_JOB, after.get()).await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].labels.get("env").map(String::as_str), Some("prod"));
    }

    #[tokio::test]
    async fn test_read_model_shape() {
        let sharder = sharder_with(1, mock_targets(&["a:1", "a:2"])).await;

        let jobs = sharder.job_index().await;
        assert_eq!(
            serde_json::to_value(&jobs).unwrap(),
            serde_json::json!({ TEST_JOB: { "_link": format!("/jobs/{}/targets", TEST_JOB) } })
        );

        let collectors = sharder.job_collector_index(TEST_JOB).await;
        assert_eq!(collectors.len(), 1);
        let entry = &collectors["collector-1"];
        assert_eq!(
            entry.link,
            format!("/jobs/{}/targets?collector_id=collector-1", TEST_JOB)
        );
        // both targets share the empty label set, so they form one group
        assert_eq!(entry.targets.len(), 1);
        assert_eq!(entry.targets[0].targets, vec!["a:1", "a:2"]);
        assert!(entry.targets[0].labels.is_empty());

        let groups = sharder.collector_groups(TEST_JOB, "collector-1").await;
        assert_eq!(groups, entry.targets);

        // unknown keys yield empty shapes, not errors
        assert!(sharder.job_collector_index("unknown").await.is_empty());
        assert!(sharder.collector_groups(TEST_JOB, "unknown").await.is_empty());
        assert!(sharder.collector_groups("unknown", "collector-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_read_model_groups_by_label_set() {
        let targets = vec![
            mock_labeled_target(TEST_JOB, "a:1", &[("env", "prod")]),
            mock_labeled_target(TEST_JOB, "a:2", &[("env", "prod")]),
            mock_labeled_target(TEST_JOB, "a:3", &[("env", "dev")]),
        ];
        let sharder = sharder_with(1, targets).await;

        let groups = sharder.collector_groups(TEST_JOB, "collector-1").await;
        assert_eq!(groups.len(), 2);
        let by_env: HashMap<&str, &TargetGroup> = groups
            .iter()
            .map(|group| (group.labels["env"].as_str(), group))
            .collect();
        assert_eq!(by_env["prod"].targets, vec!["a:1", "a:2"]);
        assert_eq!(by_env["dev"].targets, vec!["a:3"]);
    }

    #[tokio::test]
    async fn test_read_model_covers_every_assignment() {
        let mut targets = mock_targets(&["a:1", "a:2", "a:3"]);
        targets.push(mock_labeled_target("other_job", "b:1", &[("env", "prod")]));
        targets.push(mock_labeled_target("other_job", "b:2", &[("env", "dev")]));
        let sharder = sharder_with(3, targets).await;

        let mut served: HashSet<String> = HashSet::new();
        for job_name in sharder.job_index().await.keys() {
            for (collector_name, entry) in sharder.job_collector_index(job_name).await {
                let flat = sharder.collector_groups(job_name, &collector_name).await;
                assert_eq!(flat, entry.targets);
                for group in entry.targets {
                    for url in group.targets {
                        served.insert(Target::key_from(job_name, &url));
                    }
                }
            }
        }

        let assigned: HashSet<String> = sharder.assignment_keys().await.into_iter().collect();
        assert_eq!(served, assigned);
    }

    #[test]
    fn test_unknown_collector_in_assignment_fails_loudly() {
        let mut state = SharderState::default();
        state.collectors.insert(
            "collector-1".to_string(),
            Collector {
                id: CollectorId::new("collector-1".to_string()),
                num_targets: 1,
            },
        );
        state
            .target_items
            .insert(Target::key_from(TEST_JOB, "a:1"), mock_item("a:1", "ghost"));
        state.target_items.insert(
            Target::key_from(TEST_JOB, "a:2"),
            mock_item("a:2", "collector-1"),
        );

        // both records are outdated; the ghost one trips the invariant
        let err = state.next_assignment().unwrap_err();
        assert!(err.is::<InvariantViolation>());
        assert!(err.to_string().contains("unknown collector ghost"));

        // the failed attempt committed nothing
        assert_eq!(state.target_items.len(), 2);
        assert_eq!(state.collectors["collector-1"].num_targets, 1);
    }

    #[test]
    fn test_reshard_without_roster_is_an_invariant_violation() {
        let mut state = SharderState::default();
        state
            .staged
            .insert(Target::key_from(TEST_JOB, "a:1"), mock_target(TEST_JOB, "a:1"));

        let err = state.next_assignment().unwrap_err();
        assert!(err.is::<InvariantViolation>());
        assert!(err.to_string().contains("no collector instances present"));
        assert!(state.target_items.is_empty());
    }
}
