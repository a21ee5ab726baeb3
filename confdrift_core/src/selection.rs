use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum TimingError {
    #[error("Failed to read timing table {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed timing row {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// Average wall-clock seconds per regression test.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimingTable {
    averages: HashMap<String, f64>,
}

impl TimingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a `name<TAB>t1<TAB>..<TAB>tN` file, averaging every row.
    pub fn load_from_file(path: &Path) -> Result<Self, TimingError> {
        let content = std::fs::read_to_string(path).map_err(|source| TimingError::Io {
            path: path.display().to_string(),
            source,
        })?;
        content.parse()
    }

    pub fn insert(&mut self, test: impl Into<String>, average_secs: f64) {
        self.averages.insert(test.into(), average_secs);
    }

    pub fn get(&self, test: &str) -> Option<f64> {
        self.averages.get(test).copied()
    }

    pub fn len(&self) -> usize {
        self.averages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.averages.is_empty()
    }
}

impl std::str::FromStr for TimingTable {
    type Err = TimingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut table = TimingTable::new();
        for (index, row) in s.lines().enumerate() {
            let line = index + 1;
            if row.trim().is_empty() {
                continue;
            }
            let mut fields = row.split('\t');
            let name = fields.next().unwrap_or_default().trim();
            if name.is_empty() {
                return Err(TimingError::Malformed {
                    line,
                    reason: "missing test name".to_string(),
                });
            }
            let times = fields
                .map(|field| field.trim().parse::<f64>())
                .collect::<Result<Vec<f64>, _>>()
                .map_err(|e| TimingError::Malformed {
                    line,
                    reason: e.to_string(),
                })?;
            if times.is_empty() {
                return Err(TimingError::Malformed {
                    line,
                    reason: format!("no timings for '{name}'"),
                });
            }
            table.insert(name, times.iter().sum::<f64>() / times.len() as f64);
        }
        Ok(table)
    }
}

/// Total time allowed for one round of regression tests.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(from = "f64")]
pub enum Budget {
    Unbounded,
    Seconds(f64),
}

impl From<f64> for Budget {
    /// Negative values are the unbounded sentinel.
    fn from(secs: f64) -> Self {
        if secs < 0.0 || !secs.is_finite() {
            Budget::Unbounded
        } else {
            Budget::Seconds(secs)
        }
    }
}

/// Picks the regression tests to run per configuration group.
///
/// Tests slower than `scale_per_test_secs`, or without timing data, are
/// dropped first. With a bounded `total_budget` each group then receives an
/// equal share of it and keeps the longest prefix of its tests that fits.
/// Groups left empty stay in the output.
pub fn select(
    tests_by_config: &BTreeMap<String, Vec<String>>,
    timings: &TimingTable,
    scale_per_test_secs: f64,
    total_budget: Budget,
) -> BTreeMap<String, Vec<String>> {
    let filtered: BTreeMap<String, Vec<String>> = tests_by_config
        .iter()
        .map(|(config, tests)| {
            let kept = tests
                .iter()
                .filter(|test| {
                    timings
                        .get(test)
                        .is_some_and(|secs| secs <= scale_per_test_secs)
                })
                .cloned()
                .collect();
            (config.clone(), kept)
        })
        .collect();

    let Budget::Seconds(total) = total_budget else {
        return filtered;
    };
    if filtered.is_empty() {
        return filtered;
    }

    let share = total / filtered.len() as f64;
    let mut spent = 0.0;
    let selected: BTreeMap<String, Vec<String>> = filtered
        .into_iter()
        .map(|(config, tests)| {
            let mut used = 0.0;
            let mut kept = Vec::new();
            for test in tests {
                let secs = timings.get(&test).unwrap_or_default();
                if used + secs > share {
                    break;
                }
                used += secs;
                kept.push(test);
            }
            spent += used;
            (config, kept)
        })
        .collect();
    debug!(share, spent, groups = selected.len(), "Selected regression tests");
    selected
}

#[derive(Debug, Clone)]
pub struct TestSelector {
    timings: TimingTable,
    scale_per_test_secs: f64,
    total_budget: Budget,
}

impl TestSelector {
    pub fn new(timings: TimingTable, scale_per_test_secs: f64, total_budget: Budget) -> Self {
        info!(
            tests = timings.len(),
            scale_per_test_secs,
            ?total_budget,
            "Regression test selector ready"
        );
        Self {
            timings,
            scale_per_test_secs,
            total_budget,
        }
    }

    pub fn select(&self, tests_by_config: &BTreeMap<String, Vec<String>>) -> BTreeMap<String, Vec<String>> {
        select(
            tests_by_config,
            &self.timings,
            self.scale_per_test_secs,
            self.total_budget,
        )
    }

    pub fn timings(&self) -> &TimingTable {
        &self.timings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(raw: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        raw.iter()
            .map(|(config, tests)| {
                (
                    config.to_string(),
                    tests.iter().map(|t| t.to_string()).collect(),
                )
            })
            .collect()
    }

    fn timings() -> TimingTable {
        "t1\t1\t1\t1\nt2\t2\t2\t2\nt3\t3\t3\t3\nslow\t50\t70\t60\nt4\t0.5\t1.5\n"
            .parse()
            .unwrap()
    }

    #[test]
    fn timing_rows_are_averaged() {
        let table = timings();
        assert_eq!(table.get("slow"), Some(60.0));
        assert_eq!(table.get("t4"), Some(1.0));
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn malformed_rows_are_rejected() {
        assert!(matches!(
            "t1\tabc".parse::<TimingTable>(),
            Err(TimingError::Malformed { line: 1, .. })
        ));
        assert!(matches!(
            "t1\t1\n\nt2".parse::<TimingTable>(),
            Err(TimingError::Malformed { line: 3, .. })
        ));
    }

    #[test]
    fn slow_and_unknown_tests_are_dropped() {
        let input = groups(&[("a", &["t1", "slow", "unknown", "t2"])]);
        let out = select(&input, &timings(), 10.0, Budget::Unbounded);
        assert_eq!(out["a"], vec!["t1", "t2"]);
    }

    #[test]
    fn budget_is_split_evenly_and_greedy_in_order() {
        let input = groups(&[("a", &["t1", "t2", "t3"]), ("b", &["t3", "t1"]), ("c", &["slow"])]);
        let out = select(&input, &timings(), 10.0, Budget::Seconds(9.0));
        assert_eq!(out["a"], vec!["t1", "t2"]);
        assert_eq!(out["b"], vec!["t3"]);
        assert!(out["c"].is_empty());
        assert_eq!(out.len(), 3, "empty groups are kept");
    }

    #[test]
    fn selection_is_idempotent() {
        let input = groups(&[
            ("a", &["t1", "t2", "t3", "t4"]),
            ("b", &["t4", "slow", "t3"]),
            ("c", &[]),
        ]);
        let table = timings();
        for budget in [Budget::Seconds(7.5), Budget::Seconds(0.5), Budget::Unbounded] {
            let once = select(&input, &table, 5.0, budget);
            let twice = select(&once, &table, 5.0, budget);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn negative_budget_means_unbounded() {
        assert_eq!(Budget::from(-1.0), Budget::Unbounded);
        assert_eq!(Budget::from(12.0), Budget::Seconds(12.0));
        let selector = TestSelector::new(timings(), 100.0, Budget::from(-1.0));
        let out = selector.select(&groups(&[("a", &["slow", "t3"])]));
        assert_eq!(out["a"], vec!["slow", "t3"]);
    }
}
