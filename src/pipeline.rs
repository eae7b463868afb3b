//! Processing of one commit, from queued submission to stored results.

mod scoring;
mod workdir;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use chrono::Utc;

use crate::config::EngineConfig;
use crate::languages::{self, ARCHIVE_EXTENSION};
use crate::model::{Commit, CommitStatus, TestCase, TestCaseResult};
use crate::provider::{DataProvider, StorageFactory, StorageProvider};
use crate::sandbox::{ContainerRuntime, Sandbox};

pub use scoring::{MAX_SCORE, RunReport, compare_outputs, compute_score};
pub use workdir::{WorkDir, package_outputs, render_container_config, shell_quote};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AcquireStorage,
    FetchTestCases,
    Reset,
    Prepare,
    Execute,
    Evaluate,
    Store,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::AcquireStorage => "storage acquisition",
            Stage::FetchTestCases => "test case retrieval",
            Stage::Reset => "commit reset",
            Stage::Prepare => "working directory preparation",
            Stage::Execute => "sandbox execution",
            Stage::Evaluate => "result evaluation",
            Stage::Store => "result storage",
        };
        f.write_str(name)
    }
}

struct StageFailure {
    stage: Stage,
    error: anyhow::Error,
}

trait InStage<T> {
    fn in_stage(self, stage: Stage) -> Result<T, StageFailure>;
}

impl<T, E: Into<anyhow::Error>> InStage<T> for Result<T, E> {
    fn in_stage(self, stage: Stage) -> Result<T, StageFailure> {
        self.map_err(|e| StageFailure {
            stage,
            error: e.into(),
        })
    }
}

/// Everything needed to grade commits; shared by all workers.
pub struct Pipeline {
    config: Arc<EngineConfig>,
    data: Arc<dyn DataProvider>,
    storage: StorageFactory,
    sandbox: Sandbox,
}

impl Pipeline {
    pub fn new(
        config: Arc<EngineConfig>,
        data: Arc<dyn DataProvider>,
        storage: StorageFactory,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let sandbox = Sandbox::new(config.clone(), runtime);
        Self {
            config,
            data,
            storage,
            sandbox,
        }
    }

    /// Grades `commit` and returns it in its final state.
    ///
    /// Never fails: a failing stage leaves the commit `InternalError`, which
    /// is persisted on a best-effort basis. Processing a commit again starts
    /// from a clean slate, so retries are safe.
    pub async fn process_commit(&self, mut commit: Commit) -> Commit {
        log::debug!(
            "[{}] Processing commit of {} for exercise {} from {}",
            commit.id,
            commit.user_email,
            commit.exercise_id,
            commit.commit_time
        );

        let work_dir = WorkDir::for_commit(&self.config, commit.id);
        match self.run_stages(&mut commit, &work_dir).await {
            Ok(()) => log::info!(
                "[{}] Graded: {} with score {:.2}",
                commit.id,
                commit.status,
                commit.score
            ),
            Err(failure) => self.fail(&mut commit, &work_dir, failure).await,
        }
        commit
    }

    async fn run_stages(&self, commit: &mut Commit, work_dir: &WorkDir) -> Result<(), StageFailure> {
        let storage = (self.storage)().in_stage(Stage::AcquireStorage)?;

        let test_cases = self
            .data
            .fetch_test_cases(commit)
            .await
            .in_stage(Stage::FetchTestCases)?;

        self.start_over(commit).await.in_stage(Stage::Reset)?;

        log::debug!("[{}] Preparing {} test cases", commit.id, test_cases.len());
        self.prepare(storage.as_ref(), commit, &test_cases, work_dir)
            .await
            .in_stage(Stage::Prepare)?;

        self.sandbox
            .run(
                self.data.as_ref(),
                commit,
                &test_cases,
                work_dir.local(),
                work_dir.remote(),
            )
            .await
            .in_stage(Stage::Execute)?;

        let mut results = Vec::with_capacity(test_cases.len());
        if commit.status != CommitStatus::Error {
            for test_case in &test_cases {
                let result = scoring::evaluate(storage.as_ref(), commit, test_case, work_dir)
                    .await
                    .in_stage(Stage::Evaluate)?;
                results.push(result);
            }
        }
        compute_score(commit, test_cases.len(), &results);

        self.store(storage.as_ref(), commit, &results, work_dir)
            .await
            .in_stage(Stage::Store)
    }

    /// Drops whatever a previous attempt left behind.
    async fn start_over(&self, commit: &mut Commit) -> anyhow::Result<()> {
        self.data.delete_test_results(commit).await?;
        commit.reset();
        commit.compilation_started_time = Some(Utc::now());
        self.data.update_commit(commit).await?;
        Ok(())
    }

    async fn prepare(
        &self,
        storage: &dyn StorageProvider,
        commit: &mut Commit,
        test_cases: &[TestCase],
        work_dir: &WorkDir,
    ) -> anyhow::Result<()> {
        work_dir.recreate().await?;

        let descriptor = render_container_config(&self.config, commit, test_cases);
        tokio::fs::write(work_dir.local().join(&self.config.container_cfg_file), descriptor)
            .await?;

        let src_dir = work_dir.local().join(&self.config.src_dir);
        workdir::make_dir(&src_dir).await?;
        self.fetch_submission(storage, commit, &src_dir).await?;

        for name in self.data.fetch_exercise_files(commit).await? {
            let file_name = base_name(&name)?;
            let rel_path = format!("{}/{}", commit.real_exercise_id, name);
            storage
                .fetch_exercise_file(&rel_path, &src_dir.join(file_name))
                .await
                .with_context(|| format!("Fetching exercise file {rel_path}"))?;
        }

        for test_case in test_cases {
            storage
                .fetch_test_case_input_file(test_case, &work_dir.input_file(test_case.id))
                .await
                .with_context(|| format!("Fetching input of test case {}", test_case.id))?;

            let case_dir = work_dir.test_case_dir(test_case.id);
            workdir::make_dir(&case_dir).await?;
            storage
                .fetch_test_case_files(test_case, &case_dir)
                .await
                .with_context(|| format!("Fetching files of test case {}", test_case.id))?;
        }
        Ok(())
    }

    /// Copies the submission into `src_dir`, unpacking archives, and works
    /// out its language.
    async fn fetch_submission(
        &self,
        storage: &dyn StorageProvider,
        commit: &mut Commit,
        src_dir: &Path,
    ) -> anyhow::Result<()> {
        let dest = src_dir.join(base_name(&commit.fname)?);
        storage
            .fetch_commit_file(commit, &dest)
            .await
            .with_context(|| format!("Fetching submission {}", commit.storage_key))?;

        let mut extension = Path::new(&commit.fname)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(languages::standardize_extension);

        if extension == Some(ARCHIVE_EXTENSION) {
            let dest_dir = src_dir.to_path_buf();
            let deduced =
                tokio::task::spawn_blocking(move || workdir::extract_archive(&dest, &dest_dir))
                    .await??;
            log::debug!("[{}] Archive submission deduced as {deduced}", commit.id);
            extension = Some(deduced);
        }

        commit.extension = extension;
        commit.language = extension.and_then(languages::language_from_extension);
        commit.is_compilable = extension.is_some_and(languages::is_compilable);
        Ok(())
    }

    async fn store(
        &self,
        storage: &dyn StorageProvider,
        commit: &Commit,
        results: &[TestCaseResult],
        work_dir: &WorkDir,
    ) -> anyhow::Result<()> {
        self.data.update_commit(commit).await?;
        self.data.store_test_results(commit, results).await?;

        if !results.is_empty() {
            let output_dir = work_dir.local().join(&self.config.output_files_dir);
            let archive = work_dir.archive_file(commit.id);
            let max_size = self.config.max_output_file_size.0;
            let packaged = {
                let archive = archive.clone();
                tokio::task::spawn_blocking(move || {
                    package_outputs(&output_dir, &archive, max_size)
                })
                .await??
            };
            log::debug!("[{}] Archived {packaged} output files", commit.id);
            storage.store_commit_output(commit, &archive).await?;
        }

        work_dir.purge().await?;
        Ok(())
    }

    async fn fail(&self, commit: &mut Commit, work_dir: &WorkDir, failure: StageFailure) {
        log::error!(
            "[{}] {} failed: {:#}",
            commit.id,
            failure.stage,
            failure.error
        );
        if failure.stage == Stage::Store {
            log::error!("[{}] Stored data of this commit may be inconsistent", commit.id);
        }

        commit.advance(CommitStatus::InternalError);
        if let Err(e) = self.data.update_commit(commit).await {
            log::error!("[{}] Failed to record internal error: {e}", commit.id);
        }

        if self.config.cleanup_on_error {
            if let Err(e) = work_dir.purge().await {
                log::warn!(
                    "[{}] Failed to remove {}: {e}",
                    commit.id,
                    work_dir.local().display()
                );
            }
        }
    }
}

/// Last component of a stored file name; anything else could escape the
/// working directory.
fn base_name(name: &str) -> anyhow::Result<&str> {
    Path::new(name)
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("Invalid file name {name:?}"))
}
