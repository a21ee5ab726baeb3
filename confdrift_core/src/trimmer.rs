//! Delta-debugging reduction of failing configurations.
//!
//! Given a testcase that reproduces a failure, the trimmer searches for a
//! 1-minimal subset of the items that deviate from their defaults: applying
//! only that subset on top of the defaults still reproduces the failure, and
//! dropping any single item from it does not.

use crate::input::{ConfItem, Input, Testcase};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct TrimOutcome {
    pub testcase: Testcase,
    /// Deviating items kept in the minimized testcase.
    pub kept: Vec<ConfItem>,
    pub deviations_before: usize,
    pub oracle_calls: usize,
    /// `false` when the untouched testcase did not reproduce.
    pub reproduced: bool,
    /// `true` when the oracle-call budget ended the search.
    pub budget_exhausted: bool,
}

/// Item-level delta debugging over the deviations of a testcase.
#[derive(Debug, Clone, Default)]
pub struct ConfigTrimmer {
    max_oracle_calls: Option<usize>,
}

struct Search<'a, F> {
    testcase: &'a Testcase,
    defaults: &'a HashMap<String, String>,
    deviating: Vec<usize>,
    oracle: F,
    memo: HashMap<Vec<usize>, bool>,
    calls: usize,
    max_calls: Option<usize>,
}

impl<F: FnMut(&Testcase) -> bool> Search<'_, F> {
    fn budget_left(&self) -> bool {
        self.max_calls.is_none_or(|max| self.calls < max)
    }

    /// Testcase with only the deviations at `subset` (positions into
    /// `deviating`) applied on top of the defaults.
    fn build(&self, subset: &[usize]) -> Testcase {
        let keep: HashSet<usize> = subset.iter().map(|&d| self.deviating[d]).collect();
        let deviating: HashSet<usize> = self.deviating.iter().copied().collect();
        let items = self
            .testcase
            .items()
            .iter()
            .enumerate()
            .filter_map(|(index, item)| {
                if !deviating.contains(&index) || keep.contains(&index) {
                    return Some(item.clone());
                }
                self.defaults
                    .get(&item.name)
                    .map(|default| ConfItem::new(item.name.clone(), item.ty, default.clone()))
            })
            .collect();
        let mut built = Testcase::new(items);
        built.file_path = self.testcase.file_path.clone();
        built
    }

    /// Memoized oracle; `None` once the call budget is spent.
    fn test(&mut self, subset: &[usize]) -> Option<bool> {
        let mut key = subset.to_vec();
        key.sort_unstable();
        if let Some(&known) = self.memo.get(&key) {
            return Some(known);
        }
        if !self.budget_left() {
            return None;
        }
        let candidate = self.build(&key);
        self.calls += 1;
        let reproduces = (self.oracle)(&candidate);
        debug!(size = key.len(), reproduces, calls = self.calls, "Trimmer candidate checked");
        self.memo.insert(key, reproduces);
        Some(reproduces)
    }
}

fn partition(set: &[usize], n: usize) -> Vec<Vec<usize>> {
    let n = n.clamp(1, set.len().max(1));
    let base = set.len() / n;
    let extra = set.len() % n;
    let mut chunks = Vec::with_capacity(n);
    let mut start = 0;
    for i in 0..n {
        let len = base + usize::from(i < extra);
        chunks.push(set[start..start + len].to_vec());
        start += len;
    }
    chunks
}

impl ConfigTrimmer {
    pub fn new(max_oracle_calls: Option<usize>) -> Self {
        Self { max_oracle_calls }
    }

    /// Reduces `testcase` to a 1-minimal failing deviation set.
    ///
    /// Items outside the kept set are reset to their default, or dropped
    /// when they have none.
    pub fn trim<F>(&self, testcase: &Testcase, defaults: &HashMap<String, String>, oracle: F) -> TrimOutcome
    where
        F: FnMut(&Testcase) -> bool,
    {
        let deviating: Vec<usize> = testcase
            .items()
            .iter()
            .enumerate()
            .filter(|(_, item)| defaults.get(&item.name) != Some(&item.value))
            .map(|(index, _)| index)
            .collect();
        let deviations_before = deviating.len();
        let mut search = Search {
            testcase,
            defaults,
            deviating,
            oracle,
            memo: HashMap::new(),
            calls: 0,
            max_calls: self.max_oracle_calls,
        };

        let all: Vec<usize> = (0..deviations_before).collect();
        let unchanged = |calls, reproduced, budget_exhausted| TrimOutcome {
            testcase: testcase.clone(),
            kept: testcase.deviations(defaults).into_iter().cloned().collect(),
            deviations_before,
            oracle_calls: calls,
            reproduced,
            budget_exhausted,
        };

        match search.test(&all) {
            Some(true) => {}
            Some(false) => {
                info!("Failure does not reproduce, testcase left untouched");
                return unchanged(search.calls, false, false);
            }
            None => return unchanged(search.calls, false, true),
        }

        let mut current = all;
        let mut n = 2;
        let mut exhausted = false;
        'outer: while current.len() >= 2 {
            let chunks = partition(&current, n);

            for chunk in &chunks {
                match search.test(chunk) {
                    Some(true) => {
                        current = chunk.clone();
                        n = 2;
                        continue 'outer;
                    }
                    Some(false) => {}
                    None => {
                        exhausted = true;
                        break 'outer;
                    }
                }
            }

            if n > 2 {
                for chunk in &chunks {
                    let complement: Vec<usize> =
                        current.iter().copied().filter(|d| !chunk.contains(d)).collect();
                    match search.test(&complement) {
                        Some(true) => {
                            current = complement;
                            n = (n - 1).max(2);
                            continue 'outer;
                        }
                        Some(false) => {}
                        None => {
                            exhausted = true;
                            break 'outer;
                        }
                    }
                }
            }

            if n >= current.len() {
                break;
            }
            n = (n * 2).min(current.len());
        }

        if current.len() == 1 && !exhausted {
            match search.test(&[]) {
                Some(true) => current.clear(),
                Some(false) => {}
                None => exhausted = true,
            }
        }

        let minimized = search.build(&current);
        let kept: Vec<ConfItem> = current
            .iter()
            .map(|&d| testcase.items()[search.deviating[d]].clone())
            .collect();
        info!(
            before = deviations_before,
            after = kept.len(),
            oracle_calls = search.calls,
            exhausted,
            "Trimmed failing testcase"
        );
        TrimOutcome {
            testcase: minimized,
            kept,
            deviations_before,
            oracle_calls: search.calls,
            reproduced: true,
            budget_exhausted: exhausted,
        }
    }
}
