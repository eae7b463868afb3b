use async_trait::async_trait;

use crate::error::DataError;
use crate::model::{Commit, TestCase, TestCaseResult};

/// Relational metadata about commits, exercises and test cases.
///
/// Every call may fail; the pipeline treats a failure as fatal for the
/// current commit only.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Commits waiting to be graded, oldest submission first.
    async fn fetch_queued_commits(&self) -> Result<Vec<Commit>, DataError>;

    async fn update_commit(&self, commit: &Commit) -> Result<(), DataError>;

    /// Test cases of the commit's real exercise, ordered by id.
    async fn fetch_test_cases(&self, commit: &Commit) -> Result<Vec<TestCase>, DataError>;

    /// Compilation support files of the commit's real exercise, as paths
    /// relative to that exercise.
    async fn fetch_exercise_files(&self, commit: &Commit) -> Result<Vec<String>, DataError>;

    async fn store_test_results(
        &self,
        commit: &Commit,
        results: &[TestCaseResult],
    ) -> Result<(), DataError>;

    async fn delete_test_results(&self, commit: &Commit) -> Result<(), DataError>;
}
