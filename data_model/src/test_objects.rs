pub mod tests {
    use crate::{Labels, Target, TargetGroup};

    pub const TEST_JOB: &str = "test_job";

    pub fn mock_target(job_name: &str, url: &str) -> Target {
        Target {
            job_name: job_name.to_string(),
            url: url.to_string(),
            labels: Labels::new(),
        }
    }

    pub fn mock_labeled_target(job_name: &str, url: &str, labels: &[(&str, &str)]) -> Target {
        Target {
            job_name: job_name.to_string(),
            url: url.to_string(),
            labels: mock_labels(labels),
        }
    }

    pub fn mock_group(targets: &[&str], labels: &[(&str, &str)]) -> TargetGroup {
        TargetGroup {
            targets: targets.iter().map(|t| t.to_string()).collect(),
            labels: mock_labels(labels),
        }
    }

    pub fn mock_labels(labels: &[(&str, &str)]) -> Labels {
        labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    pub fn mock_collector_names(count: usize) -> Vec<String> {
        (1..=count).map(|i| format!("collector-{}", i)).collect()
    }
}
