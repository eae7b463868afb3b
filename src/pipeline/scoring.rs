use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

use crate::compare;
use crate::model::{Commit, CommitStatus, IoKind, ResultStatus, TestCase, TestCaseResult};
use crate::provider::StorageProvider;

use super::workdir::WorkDir;

/// Maximum score of a commit passing every test case.
pub const MAX_SCORE: f64 = 10.0;

/// What the container monitor reported for one test case.
#[derive(Debug, PartialEq)]
pub struct RunReport {
    /// CPU seconds used.
    pub time: f64,
    /// Signal that ended the program; empty if it exited normally.
    pub signal: String,
}

impl RunReport {
    /// Parses `key=value` (or `key: value`) lines. `time` and `signal` are
    /// required, unknown keys are ignored.
    pub fn parse(content: &str) -> Result<Self> {
        let mut time = None;
        let mut signal = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(['#', ';', '[']) {
                continue;
            }
            let Some((key, value)) = line.split_once(['=', ':']) else {
                continue;
            };
            match key.trim() {
                "time" => time = Some(value.trim().to_string()),
                "signal" => signal = Some(value.trim().to_string()),
                _ => {}
            }
        }

        let time = time.ok_or_else(|| anyhow!("Monitor report has no `time`"))?;
        let signal = signal.ok_or_else(|| anyhow!("Monitor report has no `signal`"))?;
        let time = if time.is_empty() {
            0.0
        } else {
            time.parse()
                .with_context(|| format!("Invalid time `{time}` in monitor report"))?
        };
        Ok(Self { time, signal })
    }
}

/// Grades one test case from the artifacts the container left in `work_dir`.
pub async fn evaluate(
    storage: &dyn StorageProvider,
    commit: &Commit,
    test_case: &TestCase,
    work_dir: &WorkDir,
) -> Result<TestCaseResult> {
    let monitor_file = work_dir.monitor_file(test_case.id);
    let raw = tokio::fs::read(&monitor_file)
        .await
        .with_context(|| format!("Reading {}", monitor_file.display()))?;
    let report = RunReport::parse(&String::from_utf8_lossy(&raw))?;

    let mut result = TestCaseResult {
        commit_id: commit.id,
        test_case_id: test_case.id,
        cpu_time: report.time,
        status: ResultStatus::Incorrect,
        status_message: String::new(),
    };

    if !report.signal.is_empty() {
        log::debug!(
            "[{}] Test case {} ended by signal {}",
            commit.id,
            test_case.id,
            report.signal
        );
        result.status_message = report.signal;
        return Ok(result);
    }

    let expected = work_dir.expected_output_file(test_case.id);
    storage
        .fetch_test_case_output_file(test_case, &expected)
        .await
        .with_context(|| format!("Fetching expected output of test case {}", test_case.id))?;

    let actual = work_dir.user_output_file(test_case.id);
    if !tokio::fs::try_exists(&actual).await? {
        log::debug!("[{}] Test case {} produced no output", commit.id, test_case.id);
        return Ok(result);
    }

    let abs_error = match test_case.abs_error {
        Some(abs_error) => abs_error,
        None => {
            if test_case.output_type == IoKind::Numeric {
                log::debug!(
                    "[{}] Test case {} has no tolerance, comparing exactly",
                    commit.id,
                    test_case.id
                );
            }
            0.0
        }
    };
    let kind = test_case.output_type;
    result.status =
        tokio::task::spawn_blocking(move || compare_outputs(actual, expected, kind, abs_error))
            .await??;
    Ok(result)
}

/// Strict before lenient for text: output that only matches leniently is
/// reported as malformed.
pub fn compare_outputs(
    actual: PathBuf,
    expected: PathBuf,
    kind: IoKind,
    abs_error: f64,
) -> Result<ResultStatus> {
    let status = match kind {
        IoKind::Binary => correct_if(compare::bytes_compare_files(&actual, &expected)?),
        IoKind::Numeric => correct_if(compare::numeric_tolerant_compare_files(
            &actual, &expected, abs_error,
        )?),
        IoKind::Text => {
            if compare::exact_text_compare_files(&actual, &expected)? {
                ResultStatus::Correct
            } else if compare::lenient_text_compare_files(&actual, &expected)? {
                ResultStatus::Malformed
            } else {
                ResultStatus::Incorrect
            }
        }
    };
    Ok(status)
}

fn correct_if(equal: bool) -> ResultStatus {
    if equal {
        ResultStatus::Correct
    } else {
        ResultStatus::Incorrect
    }
}

/// Sets the score, number of correct answers and final status of `commit`.
///
/// A commit that failed to compile keeps its `Error` status and scores 0.
/// Otherwise it is `Completed` only when every one of `total` test cases
/// (at least one) passed.
pub fn compute_score(commit: &mut Commit, total: usize, results: &[TestCaseResult]) {
    if commit.status == CommitStatus::Error {
        commit.corrects = 0;
        commit.score = 0.0;
        return;
    }

    let corrects = results
        .iter()
        .filter(|result| result.status == ResultStatus::Correct)
        .count();
    commit.corrects = corrects as i64;
    commit.score = if total > 0 {
        MAX_SCORE * corrects as f64 / total as f64
    } else {
        0.0
    };

    if total > 0 && corrects == total {
        commit.advance(CommitStatus::Completed);
    } else {
        commit.advance(CommitStatus::Incomplete);
    }
}
