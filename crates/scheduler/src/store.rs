//! Persistence seam for test cases and results.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use promptbench_core::{TestCase, TestCaseId, TestExecutionResult};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Write rejected: {0}")]
    Write(String),
}

/// Source of test cases and sink for results.
#[async_trait]
pub trait TestStore: Send + Sync {
    /// Load whichever of `ids` exist. Missing ids are simply absent.
    async fn load_test_cases(&self, ids: &[TestCaseId]) -> Result<Vec<TestCase>, StoreError>;

    /// Persist every result of one execution in a single write: all or none.
    async fn store_results(
        &self,
        execution_id: &str,
        results: &[TestExecutionResult],
    ) -> Result<(), StoreError>;
}

/// In-process store. Storing results again for the same execution replaces
/// the previous set.
#[derive(Default)]
pub struct MemoryStore {
    cases: RwLock<HashMap<TestCaseId, TestCase>>,
    results: RwLock<HashMap<String, Vec<TestExecutionResult>>>,
    loads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_test_case(&self, case: TestCase) {
        self.cases
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(case.id.clone(), case);
    }

    pub fn insert_test_cases(&self, cases: impl IntoIterator<Item = TestCase>) {
        let mut map = self.cases.write().unwrap_or_else(|p| p.into_inner());
        for case in cases {
            map.insert(case.id.clone(), case);
        }
    }

    pub fn results_for(&self, execution_id: &str) -> Option<Vec<TestExecutionResult>> {
        self.results
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(execution_id)
            .cloned()
    }

    /// Number of `load_test_cases` calls served.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TestStore for MemoryStore {
    async fn load_test_cases(&self, ids: &[TestCaseId]) -> Result<Vec<TestCase>, StoreError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let cases = self.cases.read().unwrap_or_else(|p| p.into_inner());
        Ok(ids.iter().filter_map(|id| cases.get(id).cloned()).collect())
    }

    async fn store_results(
        &self,
        execution_id: &str,
        results: &[TestExecutionResult],
    ) -> Result<(), StoreError> {
        self.results
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(execution_id.to_string(), results.to_vec());
        Ok(())
    }
}
