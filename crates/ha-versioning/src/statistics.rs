//! Per-automation version statistics

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ha_core::AutomationVersion;
use serde::{Deserialize, Serialize};

/// Counters over the retained versions of one automation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionStatistics {
    pub automation_id: String,
    pub connection_id: String,
    pub total_versions: usize,
    pub first_version_at: DateTime<Utc>,
    pub last_version_at: DateTime<Utc>,
    pub latest_sequence_number: u64,
    /// Author with the most versions; ties go to the lexicographically smallest name
    pub most_frequent_author: Option<String>,
    pub distinct_authors: usize,
    /// Mean time between consecutive versions, `None` with fewer than two
    pub average_interval_seconds: Option<f64>,
    /// Latest version is a tombstone
    pub retired: bool,
}

impl VersionStatistics {
    /// Compute statistics over versions in ascending sequence order
    pub fn compute<'a, I>(versions: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a AutomationVersion>,
    {
        let versions: Vec<&AutomationVersion> = versions.into_iter().collect();
        let first = *versions.first()?;
        let last = *versions.last()?;

        let mut authors: BTreeMap<&str, usize> = BTreeMap::new();
        for v in &versions {
            *authors.entry(v.author_name.as_str()).or_default() += 1;
        }

        let mut most_frequent: Option<(&str, usize)> = None;
        for (author, count) in &authors {
            // Strict comparison keeps the earliest (smallest) name on ties
            if most_frequent.map_or(true, |(_, best)| *count > best) {
                most_frequent = Some((*author, *count));
            }
        }

        let average_interval_seconds = if versions.len() > 1 {
            let span = last.created_at - first.created_at;
            Some(span.num_milliseconds() as f64 / 1000.0 / (versions.len() - 1) as f64)
        } else {
            None
        };

        Some(Self {
            automation_id: last.automation_id.clone(),
            connection_id: last.connection_id.clone(),
            total_versions: versions.len(),
            first_version_at: first.created_at,
            last_version_at: last.created_at,
            latest_sequence_number: last.sequence_number,
            most_frequent_author: most_frequent.map(|(a, _)| a.to_string()),
            distinct_authors: authors.len(),
            average_interval_seconds,
            retired: last.tombstone,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ha_core::{AutomationIdentity, NewVersion};
    use serde_json::json;

    fn version(seq: u64, author: &str, at: DateTime<Utc>) -> AutomationVersion {
        let mut v = NewVersion::new(
            AutomationIdentity::new("a1", "home-1"),
            json!({}),
            author,
            "change",
        )
        .build(seq);
        v.created_at = at;
        v
    }

    #[test]
    fn test_empty_ledger_has_no_statistics() {
        assert!(VersionStatistics::compute(std::iter::empty()).is_none());
    }

    #[test]
    fn test_counts_and_average_interval() {
        let t0 = Utc::now();
        let versions = vec![
            version(1, "bob", t0),
            version(2, "alice", t0 + Duration::seconds(10)),
            version(3, "bob", t0 + Duration::seconds(30)),
        ];

        let stats = VersionStatistics::compute(&versions).unwrap();

        assert_eq!(stats.total_versions, 3);
        assert_eq!(stats.latest_sequence_number, 3);
        assert_eq!(stats.most_frequent_author.as_deref(), Some("bob"));
        assert_eq!(stats.distinct_authors, 2);
        assert_eq!(stats.average_interval_seconds, Some(15.0));
        assert_eq!(stats.first_version_at, t0);
        assert!(!stats.retired);
    }

    #[test]
    fn test_author_tie_breaks_alphabetically() {
        let t0 = Utc::now();
        let versions = vec![version(1, "zoe", t0), version(2, "amir", t0)];
        let stats = VersionStatistics::compute(&versions).unwrap();
        assert_eq!(stats.most_frequent_author.as_deref(), Some("amir"));
    }

    #[test]
    fn test_single_version_has_no_interval() {
        let versions = vec![version(1, "bob", Utc::now())];
        let stats = VersionStatistics::compute(&versions).unwrap();
        assert_eq!(stats.average_interval_seconds, None);
    }
}
