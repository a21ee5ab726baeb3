use crate::input::{Input, Seed, Testcase};
use crate::pool::{PoolError, SeedOrigin, SeedPool};
use crate::result::{TestResult, TestStatus};
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum FeedbackError {
    #[error("Pool operation failed within feedback: {0}")]
    PoolInteractionError(#[from] PoolError),
}

/// Decides which executed testcases go back into the seed pool.
pub trait Feedback: Send + Sync {
    fn name(&self) -> &'static str;

    /// Learns the seeds already in the pool so they are not re-added.
    fn init(&mut self, pool: &dyn SeedPool) -> Result<(), FeedbackError>;

    fn is_interesting(&mut self, testcase: &Testcase, result: &TestResult) -> Result<bool, FeedbackError>;

    /// Adds `testcase` to the pool if it is new. Returns the assigned seed ID.
    fn report_interesting(
        &mut self,
        testcase: Testcase,
        origin: SeedOrigin,
        pool: &mut dyn SeedPool,
    ) -> Result<Option<usize>, FeedbackError>;
}

/// Re-seeds passing testcases whose md5 fingerprint has not been seen before.
#[derive(Default)]
pub struct UniqueInputFeedback {
    pub known_hashes: HashSet<[u8; 16]>,
}

impl UniqueInputFeedback {
    pub fn new() -> Self {
        Self {
            known_hashes: HashSet::new(),
        }
    }
}

impl Feedback for UniqueInputFeedback {
    fn name(&self) -> &'static str {
        "UniqueInputFeedback"
    }

    fn init(&mut self, pool: &dyn SeedPool) -> Result<(), FeedbackError> {
        for id in 0..pool.len() {
            let entry = pool.get(id).ok_or(PoolError::SeedNotFound(id))?;
            self.known_hashes.insert(entry.fingerprint);
        }
        Ok(())
    }

    fn is_interesting(&mut self, testcase: &Testcase, result: &TestResult) -> Result<bool, FeedbackError> {
        if result.status != TestStatus::Pass || testcase.is_empty() {
            return Ok(false);
        }
        Ok(!self.known_hashes.contains(&testcase.fingerprint()))
    }

    fn report_interesting(
        &mut self,
        testcase: Testcase,
        origin: SeedOrigin,
        pool: &mut dyn SeedPool,
    ) -> Result<Option<usize>, FeedbackError> {
        let hash = testcase.fingerprint();
        if !self.known_hashes.insert(hash) {
            debug!("Testcase already pooled, not re-seeding");
            return Ok(None);
        }
        let id = pool.add(Seed::from(testcase), origin)?;
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{ConfItem, ConfType};
    use crate::pool::InMemoryPool;
    use crate::result::{Artifacts, ExceptionType};

    fn testcase(value: &str) -> Testcase {
        Testcase::new(vec![ConfItem::new("io.sort.mb", ConfType::Int, value)])
    }

    #[test]
    fn unique_input_feedback_works() {
        let mut feedback = UniqueInputFeedback::new();
        let mut pool = InMemoryPool::new();
        pool.add(Seed::from(testcase("100")), SeedOrigin::Baseline).unwrap();
        feedback.init(&pool).unwrap();

        let pass = TestResult::pass(Artifacts::default());
        assert!(!feedback.is_interesting(&testcase("100"), &pass).unwrap());

        let novel = testcase("200");
        assert!(feedback.is_interesting(&novel, &pass).unwrap());
        let id = feedback
            .report_interesting(novel.clone(), SeedOrigin::Mutated { parent: 0 }, &mut pool)
            .unwrap();
        assert_eq!(id, Some(1));
        assert_eq!(pool.len(), 2);
        assert!(!feedback.is_interesting(&novel, &pass).unwrap());

        let again = feedback
            .report_interesting(novel, SeedOrigin::Mutated { parent: 0 }, &mut pool)
            .unwrap();
        assert_eq!(again, None);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn failing_and_empty_testcases_are_not_interesting() {
        let mut feedback = UniqueInputFeedback::new();
        let fail = TestResult::fail(ExceptionType::Memory, Artifacts::default());
        assert!(!feedback.is_interesting(&testcase("1"), &fail).unwrap());

        let pass = TestResult::pass(Artifacts::default());
        assert!(!feedback.is_interesting(&Testcase::new(Vec::new()), &pass).unwrap());
    }
}
