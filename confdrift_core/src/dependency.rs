use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Component, Path};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::value::Quantity;

/// The relation a dependent parameter must keep with the parameter it depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConstraintKind {
    /// The dependent value must differ from the source value.
    Distinct,
    /// The dependent path must lie strictly below the source path.
    SubPath,
    /// The dependent number must be numerically greater than the source.
    Greater,
    /// The dependent number must be numerically smaller than the source.
    Less,
}

impl ConstraintKind {
    /// Checks whether `dependent` satisfies this constraint relative to `source`.
    pub fn holds(&self, source: &str, dependent: &str) -> bool {
        match self {
            ConstraintKind::Distinct => source != dependent,
            ConstraintKind::SubPath => is_strict_sub_path(source, dependent),
            ConstraintKind::Greater => compare_numeric(source, dependent)
                .is_some_and(|(src, dep)| dep > src),
            ConstraintKind::Less => compare_numeric(source, dependent)
                .is_some_and(|(src, dep)| dep < src),
        }
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConstraintKind::Distinct => "distinct",
            ConstraintKind::SubPath => "sub-path",
            ConstraintKind::Greater => "greater",
            ConstraintKind::Less => "less",
        };
        f.write_str(name)
    }
}

fn compare_numeric(source: &str, dependent: &str) -> Option<(f64, f64)> {
    let src = Quantity::parse(source)?;
    let dep = Quantity::parse(dependent)?;
    Some((src.magnitude, dep.magnitude))
}

fn is_strict_sub_path(parent: &str, child: &str) -> bool {
    let parent: Vec<Component<'_>> = Path::new(parent).components().collect();
    let child: Vec<Component<'_>> = Path::new(child).components().collect();
    child.len() > parent.len() && child.starts_with(&parent)
}

/// One `(dependent, kind)` entry of a parameter's relation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub dependent: String,
    pub kind: ConstraintKind,
}

impl Relation {
    pub fn new(dependent: impl Into<String>, kind: ConstraintKind) -> Self {
        Self {
            dependent: dependent.into(),
            kind,
        }
    }
}

/// Read-only map from a parameter name to the ordered relations it imposes on
/// other parameters.
#[derive(Debug, Clone, Default)]
pub struct DependencyModel {
    relations: HashMap<String, Vec<Relation>>,
}

impl DependencyModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_relation(&mut self, source: impl Into<String>, relation: Relation) {
        self.relations.entry(source.into()).or_default().push(relation);
    }

    /// Relations declared for `name`, in declaration order. Empty when none.
    pub fn relations(&self, name: &str) -> &[Relation] {
        self.relations
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.relations.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<(String, Relation)> for DependencyModel {
    fn from_iter<T: IntoIterator<Item = (String, Relation)>>(iter: T) -> Self {
        let mut model = DependencyModel::new();
        for (source, relation) in iter {
            model.add_relation(source, relation);
        }
        model
    }
}

/// Per-parameter mutation counters.
///
/// The key set is fixed at construction; every round only increments, so the
/// store is shared behind an `Arc` without a lock. Unknown names are ignored.
#[derive(Debug, Default)]
pub struct MutationCounters {
    counters: HashMap<String, AtomicU64>,
}

impl MutationCounters {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            counters: names
                .into_iter()
                .map(|name| (name.into(), AtomicU64::new(0)))
                .collect(),
        }
    }

    /// Increments the counter for `name`. Returns `false` for unknown names.
    pub fn record(&self, name: &str) -> bool {
        match self.counters.get(name) {
            Some(counter) => {
                counter.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.counters
            .get(name)
            .map(|counter| counter.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|(name, counter)| (name.clone(), counter.load(Ordering::Relaxed)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relations_keep_declaration_order() {
        let mut model = DependencyModel::new();
        model.add_relation("a", Relation::new("b", ConstraintKind::Greater));
        model.add_relation("a", Relation::new("c", ConstraintKind::Distinct));
        let dependents: Vec<&str> = model
            .relations("a")
            .iter()
            .map(|r| r.dependent.as_str())
            .collect();
        assert_eq!(dependents, vec!["b", "c"]);
        assert!(model.relations("missing").is_empty());
        assert_eq!(model.len(), 2);
    }

    #[test]
    fn counters_ignore_unknown_names() {
        let counters = MutationCounters::new(["known"]);
        assert!(counters.record("known"));
        assert!(counters.record("known"));
        assert!(!counters.record("never.declared"));
        assert_eq!(counters.get("known"), Some(2));
        assert_eq!(counters.get("never.declared"), None);
        assert_eq!(counters.snapshot().len(), 1);
    }

    #[test]
    fn constraint_checks() {
        assert!(ConstraintKind::Distinct.holds("8020", "8021"));
        assert!(!ConstraintKind::Distinct.holds("8020", "8020"));

        assert!(ConstraintKind::Greater.holds("10", "11"));
        assert!(ConstraintKind::Greater.holds("64m", "128m"));
        assert!(!ConstraintKind::Greater.holds("10", "10"));
        assert!(!ConstraintKind::Greater.holds("ten", "11"));

        assert!(ConstraintKind::Less.holds("10", "-3"));
        assert!(!ConstraintKind::Less.holds("10", "12"));

        assert!(ConstraintKind::SubPath.holds("/data/hbase", "/data/hbase/wal"));
        assert!(!ConstraintKind::SubPath.holds("/data/hbase", "/data/hbase"));
        assert!(!ConstraintKind::SubPath.holds("/data/hbase", "/data/hbase2/wal"));
    }

    #[test]
    fn constraint_kind_deserializes_kebab_case() {
        let kind: ConstraintKind = serde_json::from_str("\"sub-path\"").unwrap();
        assert_eq!(kind, ConstraintKind::SubPath);
        assert_eq!(kind.to_string(), "sub-path");
    }
}
