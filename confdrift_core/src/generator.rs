use crate::input::{ConfItem, Input, Seed, Testcase};
use crate::mutator::{MutationError, Mutator};
use rand::Rng;
use tracing::debug;

/// Wraps the active mutation strategy and keeps infrastructure-critical items
/// out of its reach.
///
/// Pinned items are removed from a working copy of the seed by structural
/// equality before the strategy runs, so no strategy can ever change them.
pub struct TestcaseGenerator<R: Rng + ?Sized> {
    mutator: Box<dyn Mutator<R> + Send>,
    pinned: Vec<ConfItem>,
}

impl<R: Rng + ?Sized> TestcaseGenerator<R> {
    pub fn new(mutator: Box<dyn Mutator<R> + Send>, pinned: Vec<ConfItem>) -> Self {
        Self { mutator, pinned }
    }

    pub fn pinned(&self) -> &[ConfItem] {
        &self.pinned
    }

    pub fn mutator_name(&self) -> &'static str {
        self.mutator.name()
    }

    pub fn generate(&mut self, seed: &Seed, rng: &mut R) -> Result<Testcase, MutationError> {
        let mut working = seed.clone();
        for item in &self.pinned {
            if working.remove(item) {
                debug!(name = %item.name, "Withheld pinned item from mutation");
            }
        }
        self.mutator.mutate(&working, rng)
    }
}

impl<R: Rng + ?Sized> std::fmt::Debug for TestcaseGenerator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestcaseGenerator")
            .field("mutator", &self.mutator.name())
            .field("pinned", &self.pinned.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::{DependencyModel, MutationCounters};
    use crate::input::ConfType;
    use crate::mutator::{MutationContext, MutatorKind};
    use crate::value::ValueGenerator;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    fn generator(kind: MutatorKind, pinned: Vec<ConfItem>) -> TestcaseGenerator<ChaCha8Rng> {
        let context = MutationContext::new(
            DependencyModel::new(),
            ValueGenerator::new(),
            Arc::new(MutationCounters::default()),
        );
        TestcaseGenerator::new(kind.build(context, Arc::new(AtomicBool::new(true))), pinned)
    }

    #[test]
    fn pinned_items_never_reach_the_mutator() {
        let fs = ConfItem::new("fs.defaultFS", ConfType::Port, "hdfs://127.0.0.1:9000");
        let root = ConfItem::new("hbase.rootdir", ConfType::DirPath, "/data/hbase");
        let seed = Seed::from_items(vec![
            fs.clone(),
            ConfItem::new("a", ConfType::Int, "1"),
            root.clone(),
            ConfItem::new("b", ConfType::Bool, "true"),
        ]);
        let mut rng = ChaCha8Rng::from_seed([3u8; 32]);

        for kind in [MutatorKind::Smart, MutatorKind::Stacked] {
            let mut generator = generator(kind, vec![fs.clone(), root.clone()]);
            for _ in 0..20 {
                let testcase = generator.generate(&seed, &mut rng).unwrap();
                assert_eq!(testcase.len(), 2);
                assert!(testcase.find("fs.defaultFS").is_none());
                assert!(testcase.find("hbase.rootdir").is_none());
            }
        }
        assert_eq!(seed.len(), 4, "seed is left intact");
    }

    #[test]
    fn pinned_items_with_other_values_are_fuzzed() {
        let pinned = ConfItem::new("hbase.rootdir", ConfType::DirPath, "/data/hbase");
        let seed = Seed::from_items(vec![ConfItem::new(
            "hbase.rootdir",
            ConfType::DirPath,
            "/elsewhere",
        )]);
        let mut generator = generator(MutatorKind::Smart, vec![pinned]);
        let mut rng = ChaCha8Rng::from_seed([4u8; 32]);
        let testcase = generator.generate(&seed, &mut rng).unwrap();
        assert_eq!(testcase.len(), 1);
        assert_ne!(testcase.items()[0].value, "/elsewhere");
    }
}
