use crate::dependency::{DependencyModel, MutationCounters};
use crate::input::{ConfItem, Input, Seed, Testcase};
use crate::value::{ValueError, ValueGenerator};
use rand::Rng;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

/// Round sizes the stacked strategy draws from.
const STACKED_ROUND_SIZES: std::ops::RangeInclusive<usize> = 3..=5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MutationError {
    #[error("Seed carries no configuration items")]
    EmptySeed,
    #[error("Value generation failed: {0}")]
    Value(#[from] ValueError),
}

/// A `Mutator` turns a seed configuration into a new testcase.
///
/// Implementations never modify the seed; every changed item is a copy staged
/// at the position of its original.
///
/// # Type Parameters
/// * `R`: The type of random number generator used for mutation decisions.
pub trait Mutator<R: Rng + ?Sized> {
    fn name(&self) -> &'static str;

    /// Produces a testcase with the same length and item names as `seed`.
    fn mutate(&mut self, seed: &Seed, rng: &mut R) -> Result<Testcase, MutationError>;
}

/// Everything a mutation round reads: the dependency relations, the value
/// generator and the counter store it reports into.
#[derive(Debug, Clone)]
pub struct MutationContext {
    pub dependencies: Arc<DependencyModel>,
    pub values: Arc<ValueGenerator>,
    pub counters: Arc<MutationCounters>,
}

impl MutationContext {
    pub fn new(
        dependencies: DependencyModel,
        values: ValueGenerator,
        counters: Arc<MutationCounters>,
    ) -> Self {
        Self {
            dependencies: Arc::new(dependencies),
            values: Arc::new(values),
            counters,
        }
    }

    /// Runs one round of `round_size` draws over `seed`.
    ///
    /// Draws are made with replacement: the same index can be picked twice in
    /// one round, and the later staging wins.
    fn run_round<R: Rng + ?Sized>(
        &self,
        seed: &Seed,
        round_size: usize,
        rng: &mut R,
    ) -> Result<Testcase, MutationError> {
        if seed.is_empty() {
            return Err(MutationError::EmptySeed);
        }

        let mut staged: BTreeMap<usize, ConfItem> = BTreeMap::new();
        for _ in 0..round_size {
            let index = rng.random_range(0..seed.len());
            let mut item_a = seed.items()[index].clone();
            item_a.value = self.values.generate(&item_a, rng)?;

            for relation in self.dependencies.relations(&item_a.name) {
                match seed.find(&relation.dependent) {
                    Some((dep_index, dependent)) if dep_index != index => {
                        let mut item_b = dependent.clone();
                        self.values
                            .apply_constraint(relation.kind, &item_a, &mut item_b, rng)?;
                        debug!(
                            source = %item_a.name,
                            dependent = %item_b.name,
                            kind = %relation.kind,
                            value = %item_b.value,
                            "Applied constraint"
                        );
                        item_b.mutated = true;
                        staged.insert(dep_index, item_b);
                    }
                    _ => {
                        debug!(
                            source = %item_a.name,
                            dependent = %relation.dependent,
                            "Dependent absent from seed, mutating source alone"
                        );
                    }
                }
            }

            debug!(name = %item_a.name, ty = %item_a.ty, value = %item_a.value, "Mutated item");
            item_a.mutated = true;
            staged.insert(index, item_a);
        }

        for item in staged.values() {
            if !self.counters.record(&item.name) {
                debug!(name = %item.name, "No mutation counter for parameter");
            }
        }

        let items = seed
            .items()
            .iter()
            .enumerate()
            .map(|(index, original)| staged.remove(&index).unwrap_or_else(|| original.clone()))
            .collect();
        Ok(Testcase::new(items))
    }
}

/// Perturbs a random draw of three to five items per round.
#[derive(Debug, Clone)]
pub struct StackedMutator {
    context: MutationContext,
}

impl StackedMutator {
    pub fn new(context: MutationContext) -> Self {
        Self { context }
    }
}

impl<R: Rng + ?Sized> Mutator<R> for StackedMutator {
    fn name(&self) -> &'static str {
        "StackedMutator"
    }

    fn mutate(&mut self, seed: &Seed, rng: &mut R) -> Result<Testcase, MutationError> {
        let round_size = rng.random_range(STACKED_ROUND_SIZES);
        self.context.run_round(seed, round_size, rng)
    }
}

/// Perturbs a single item per round, or every item while the shared stacking
/// switch is on. Empty seeds yield an empty testcase.
#[derive(Debug, Clone)]
pub struct SmartMutator {
    context: MutationContext,
    stacking: Arc<AtomicBool>,
}

impl SmartMutator {
    pub fn new(context: MutationContext, stacking: Arc<AtomicBool>) -> Self {
        Self { context, stacking }
    }
}

impl<R: Rng + ?Sized> Mutator<R> for SmartMutator {
    fn name(&self) -> &'static str {
        "SmartMutator"
    }

    fn mutate(&mut self, seed: &Seed, rng: &mut R) -> Result<Testcase, MutationError> {
        if seed.is_empty() {
            warn!("Seed carries no configuration items, skipping mutation");
            return Ok(Testcase::default());
        }
        let round_size = if self.stacking.load(Ordering::Relaxed) {
            seed.len()
        } else {
            1
        };
        self.context.run_round(seed, round_size, rng)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MutatorKind {
    Stacked,
    #[default]
    Smart,
}

impl MutatorKind {
    /// Builds the strategy selected for a campaign.
    pub fn build<R: Rng + ?Sized>(
        self,
        context: MutationContext,
        stacking: Arc<AtomicBool>,
    ) -> Box<dyn Mutator<R> + Send> {
        match self {
            MutatorKind::Stacked => Box::new(StackedMutator::new(context)),
            MutatorKind::Smart => Box::new(SmartMutator::new(context, stacking)),
        }
    }
}

impl std::str::FromStr for MutatorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stacked" | "stackedmutator" => Ok(MutatorKind::Stacked),
            "smart" | "smartmutator" => Ok(MutatorKind::Smart),
            other => Err(format!("unknown mutator '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::{ConstraintKind, Relation};
    use crate::input::ConfType;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::collections::HashMap;

    fn int_seed(n: usize) -> Seed {
        Seed::from_items((0..n).map(|i| ConfItem::new(format!("ci{i}"), ConfType::Int, i.to_string())))
    }

    fn context(model: DependencyModel, names: &[String]) -> MutationContext {
        MutationContext::new(
            model,
            ValueGenerator::new(),
            Arc::new(MutationCounters::new(names.iter().cloned())),
        )
    }

    fn names_of(input: &impl Input) -> Vec<String> {
        let mut names: Vec<String> = input.items().iter().map(|i| i.name.clone()).collect();
        names.sort();
        names
    }

    #[test]
    fn smart_mutator_changes_exactly_one_item() {
        let seed = int_seed(20);
        let mut mutator = SmartMutator::new(
            context(DependencyModel::new(), &[]),
            Arc::new(AtomicBool::new(false)),
        );
        let mut rng = ChaCha8Rng::from_seed([0u8; 32]);

        for _ in 0..50 {
            let testcase = mutator.mutate(&seed, &mut rng).unwrap();
            assert_eq!(testcase.len(), seed.len());
            let changed: Vec<(usize, &ConfItem)> = testcase
                .items()
                .iter()
                .enumerate()
                .filter(|(i, item)| item.value != seed.items()[*i].value)
                .collect();
            assert_eq!(changed.len(), 1, "exactly one position differs");
            let (index, item) = changed[0];
            assert_eq!(item.name, format!("ci{index}"));
            assert!(item.mutated);
            item.value.parse::<i64>().expect("mutated value is an integer");
        }
    }

    #[test]
    fn smart_mutator_returns_empty_testcase_for_empty_seed() {
        let mut mutator = SmartMutator::new(
            context(DependencyModel::new(), &[]),
            Arc::new(AtomicBool::new(true)),
        );
        let mut rng = ChaCha8Rng::from_seed([1u8; 32]);
        let testcase = mutator.mutate(&Seed::new(), &mut rng).unwrap();
        assert!(testcase.is_empty());
    }

    #[test]
    fn stacked_mutator_rejects_empty_seed() {
        let mut mutator = StackedMutator::new(context(DependencyModel::new(), &[]));
        let mut rng = ChaCha8Rng::from_seed([1u8; 32]);
        assert_eq!(
            mutator.mutate(&Seed::new(), &mut rng),
            Err(MutationError::EmptySeed)
        );
    }

    #[test]
    fn stacked_mutator_preserves_length_and_names() {
        let seed = int_seed(12);
        let mut mutator = StackedMutator::new(context(DependencyModel::new(), &[]));
        let mut rng = ChaCha8Rng::from_seed([4u8; 32]);
        for _ in 0..50 {
            let testcase = mutator.mutate(&seed, &mut rng).unwrap();
            assert_eq!(names_of(&testcase), names_of(&seed));
            let changed = testcase.mutated_items().count();
            assert!((1..=5).contains(&changed), "changed {changed} items");
        }
        for item in seed.items() {
            assert!(!item.mutated, "seed must not be touched");
        }
    }

    #[test]
    fn stacking_switch_mutates_every_draw() {
        let seed = int_seed(8);
        let stacking = Arc::new(AtomicBool::new(true));
        let mut mutator = SmartMutator::new(context(DependencyModel::new(), &[]), stacking.clone());
        let mut rng = ChaCha8Rng::from_seed([5u8; 32]);
        let testcase = mutator.mutate(&seed, &mut rng).unwrap();
        assert!(testcase.mutated_items().count() >= 1);
        assert_eq!(testcase.len(), 8);

        stacking.store(false, Ordering::Relaxed);
        let testcase = mutator.mutate(&seed, &mut rng).unwrap();
        assert_eq!(testcase.mutated_items().count(), 1);
    }

    #[test]
    fn dependent_items_satisfy_constraints() {
        let seed = Seed::from_items(vec![
            ConfItem::new("rpc.port", ConfType::Port, "8020"),
            ConfItem::new("http.port", ConfType::Port, "8021"),
        ]);
        let mut model = DependencyModel::new();
        model.add_relation("rpc.port", Relation::new("http.port", ConstraintKind::Distinct));
        model.add_relation("http.port", Relation::new("rpc.port", ConstraintKind::Distinct));
        let mut mutator = SmartMutator::new(
            context(model, &["rpc.port".to_string(), "http.port".to_string()]),
            Arc::new(AtomicBool::new(false)),
        );
        let mut rng = ChaCha8Rng::from_seed([6u8; 32]);
        for _ in 0..100 {
            let testcase = mutator.mutate(&seed, &mut rng).unwrap();
            let values: HashMap<&str, &str> = testcase
                .items()
                .iter()
                .map(|item| (item.name.as_str(), item.value.as_str()))
                .collect();
            assert_ne!(values["rpc.port"], values["http.port"]);
            assert_eq!(testcase.mutated_items().count(), 2);
        }
    }

    #[test]
    fn missing_dependent_falls_back_to_source_alone() {
        let seed = Seed::from_items(vec![ConfItem::new("heap.min", ConfType::Size, "256m")]);
        let mut model = DependencyModel::new();
        model.add_relation("heap.min", Relation::new("heap.max", ConstraintKind::Greater));
        let mut mutator = SmartMutator::new(context(model, &[]), Arc::new(AtomicBool::new(false)));
        let mut rng = ChaCha8Rng::from_seed([8u8; 32]);
        let testcase = mutator.mutate(&seed, &mut rng).unwrap();
        assert_eq!(testcase.len(), 1);
        assert_ne!(testcase.items()[0].value, "256m");
    }

    #[test]
    fn counters_track_staged_items_and_skip_unknown_names() {
        let seed = int_seed(3);
        let counters = Arc::new(MutationCounters::new(["ci0"]));
        let ctx = MutationContext::new(DependencyModel::new(), ValueGenerator::new(), counters.clone());
        let mut mutator = SmartMutator::new(ctx, Arc::new(AtomicBool::new(false)));
        let mut rng = ChaCha8Rng::from_seed([2u8; 32]);
        let mut expected = 0;
        for _ in 0..30 {
            let testcase = mutator.mutate(&seed, &mut rng).unwrap();
            if testcase.items()[0].mutated {
                expected += 1;
            }
        }
        assert_eq!(counters.get("ci0"), Some(expected));
    }

    #[test]
    fn value_errors_abort_the_round() {
        let seed = Seed::from_items(vec![ConfItem::new("mode", ConfType::Enum, "a")]);
        let mut mutator = SmartMutator::new(
            context(DependencyModel::new(), &[]),
            Arc::new(AtomicBool::new(false)),
        );
        let mut rng = ChaCha8Rng::from_seed([2u8; 32]);
        assert!(matches!(
            mutator.mutate(&seed, &mut rng),
            Err(MutationError::Value(ValueError::NoEnumDomain(_)))
        ));
    }

    #[test]
    fn mutator_kind_builds_selected_strategy() {
        let ctx = context(DependencyModel::new(), &[]);
        let stacking = Arc::new(AtomicBool::new(false));
        let smart = MutatorKind::Smart.build::<ChaCha8Rng>(ctx.clone(), stacking.clone());
        assert_eq!(smart.name(), "SmartMutator");
        let stacked = MutatorKind::Stacked.build::<ChaCha8Rng>(ctx, stacking);
        assert_eq!(stacked.name(), "StackedMutator");
        assert_eq!("stacked".parse::<MutatorKind>(), Ok(MutatorKind::Stacked));
    }
}
