use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::{EngineConfig, saturating_secs};
use crate::error::SandboxError;
use crate::model::{Commit, CommitStatus, TestCase};
use crate::provider::DataProvider;

use super::protocol::{Handshake, Milestone};
use super::runtime::{Container, ContainerRuntime};

/// Signal recorded on a commit whose compilation produced diagnostics.
pub const COMPILE_ERROR_SIGNAL: i64 = 1;

/// Runs submissions in containers and follows their milestones.
pub struct Sandbox {
    config: Arc<EngineConfig>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl Sandbox {
    pub fn new(config: Arc<EngineConfig>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { config, runtime }
    }

    /// Deadline for each run milestone: a fixed overhead per test case plus
    /// the sum of their CPU-time budgets, as the container runs them one
    /// after another.
    ///
    /// Budgets come from the database unchecked, so the sum saturates.
    pub fn run_timeout(&self, test_cases: &[TestCase]) -> Duration {
        let slots = u32::try_from(test_cases.len()).map_or(u32::MAX, |n| n.saturating_add(1));
        let base = self
            .config
            .base_exec_timeout
            .as_duration()
            .checked_mul(slots)
            .unwrap_or(Duration::MAX);
        let budgets: f64 = test_cases
            .iter()
            .map(|tc| tc.cpu_time)
            .filter(|t| *t > 0.0)
            .sum();
        base.saturating_add(saturating_secs(budgets))
    }

    /// Runs `commit` in a fresh container with `remote_dir` mounted, updating
    /// its status as milestones arrive.
    ///
    /// `work_dir` is the same directory as seen from this host. The container
    /// is always torn down before returning, whatever the outcome.
    pub async fn run(
        &self,
        data: &dyn DataProvider,
        commit: &mut Commit,
        test_cases: &[TestCase],
        work_dir: &Path,
        remote_dir: &Path,
    ) -> Result<(), SandboxError> {
        let language = commit.language.ok_or(SandboxError::MissingLanguage)?;
        let image = language.image(&self.config.image_template);
        let run_timeout = self.run_timeout(test_cases);

        log::debug!("[{}] Launching {image}", commit.id);
        let mut container = self
            .runtime
            .launch(&image, remote_dir, &self.config.guest_dir)
            .await?;

        let outcome = self
            .follow(container.as_mut(), data, commit, run_timeout, work_dir)
            .await;
        self.teardown(container.as_mut(), commit.id).await;
        outcome
    }

    async fn follow(
        &self,
        container: &mut dyn Container,
        data: &dyn DataProvider,
        commit: &mut Commit,
        run_timeout: Duration,
        work_dir: &Path,
    ) -> Result<(), SandboxError> {
        let mut handshake = Handshake::new(commit.is_compilable);

        if commit.is_compilable {
            let timeout = self.config.compilation_timeout.as_duration();

            expect(container, &mut handshake, timeout, commit.id).await?;
            commit.advance(CommitStatus::Compiling);
            data.update_commit(commit).await?;

            expect(container, &mut handshake, timeout, commit.id).await?;
            let diagnostics =
                read_diagnostics(&work_dir.join(&self.config.compilation_error_file)).await?;
            if diagnostics.is_empty() {
                commit.advance(CommitStatus::Compiled);
                commit.is_compiled = true;
            } else {
                log::debug!("[{}] Compilation failed", commit.id);
                commit.advance(CommitStatus::Error);
                commit.compiled_error = diagnostics;
                commit.compiled_signal = Some(COMPILE_ERROR_SIGNAL);
                commit.is_compiled = false;
                handshake.abandon();
            }
        } else {
            commit.is_compiled = true;
        }

        commit.compilation_finished_time = Some(Utc::now());
        data.update_commit(commit).await?;

        if commit.status == CommitStatus::Error {
            return Ok(());
        }

        expect(container, &mut handshake, run_timeout, commit.id).await?;
        commit.advance(CommitStatus::Running);
        data.update_commit(commit).await?;

        expect(container, &mut handshake, run_timeout, commit.id).await?;
        Ok(())
    }

    /// Best effort: failures are logged, never raised.
    async fn teardown(&self, container: &mut dyn Container, commit_id: i64) {
        let grace = self.config.base_exec_timeout.as_duration();
        if let Err(e) = container.wait(grace).await {
            log::error!("[{commit_id}] Container {} did not stop: {e}", container.id());
            if let Err(e) = container.kill().await {
                log::error!("[{commit_id}] Failed to kill container {}: {e}", container.id());
            }
        }
        if let Err(e) = container.remove().await {
            log::error!("[{commit_id}] Failed to remove container {}: {e}", container.id());
        }
    }
}

/// Waits up to `timeout` for the next milestone of `handshake`.
async fn expect(
    container: &mut dyn Container,
    handshake: &mut Handshake,
    timeout: Duration,
    commit_id: i64,
) -> Result<Milestone, SandboxError> {
    let Some(expected) = handshake.expected() else {
        return Err(SandboxError::TrailingOutput(String::new()));
    };

    let line = match tokio::time::timeout(timeout, container.next_line()).await {
        Err(_) => {
            log::warn!("[{commit_id}] Timed out waiting for `{expected}`");
            return Err(SandboxError::TimedOut {
                milestone: expected,
                after: timeout,
            });
        }
        Ok(Ok(None)) => return Err(SandboxError::StreamClosed { expected }),
        Ok(Ok(Some(line))) => line,
        Ok(Err(e)) => return Err(e),
    };

    let milestone = handshake.accept(&line)?;
    log::debug!("[{commit_id}] Reached `{milestone}`");
    Ok(milestone)
}

/// Compiler output may echo user source, so undecodable bytes are replaced.
async fn read_diagnostics(path: &Path) -> Result<String, SandboxError> {
    let raw = tokio::fs::read(path).await?;
    Ok(String::from_utf8_lossy(&raw).trim().to_string())
}
