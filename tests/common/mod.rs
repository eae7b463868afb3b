#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use tempfile::TempDir;

use grader::config::{EngineConfig, Second};
use grader::error::{DataError, SandboxError};
use grader::languages;
use grader::model::{Commit, CommitStatus, IoKind, TestCase, TestCaseResult};
use grader::pipeline::Pipeline;
use grader::provider::{DataProvider, FilesystemStorage, StorageFactory};
use grader::sandbox::{Container, ContainerRuntime};

pub fn commit(id: i64, fname: &str) -> Commit {
    Commit {
        id,
        user_email: format!("student{id}@example.com"),
        exercise_id: 1,
        real_exercise_id: 1,
        offering_id: 10,
        real_offering_id: 10,
        course_id: 100,
        status: CommitStatus::InQueue,
        commit_hash: format!("hash{id}"),
        corrects: 0,
        score: 0.0,
        is_compiled: false,
        compiled_message: String::new(),
        compiled_signal: None,
        compiled_error: String::new(),
        commit_time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, id as u32 % 60).unwrap(),
        compilation_started_time: None,
        compilation_finished_time: None,
        user_ip: Some("10.0.0.1".to_string()),
        storage_key: format!("{id}/{fname}"),
        fname: fname.to_string(),
        extension: None,
        language: languages::language_from_extension(fname),
        is_compilable: false,
    }
}

pub fn test_case(id: i64, kind: IoKind) -> TestCase {
    TestCase {
        id,
        exercise_id: 1,
        input_type: kind,
        output_type: kind,
        show_input: true,
        show_expected_output: true,
        show_user_output: true,
        max_mem_size: 64 << 20,
        cpu_time: 1.0,
        stack_size: 8 << 20,
        file_size: 1 << 20,
        abs_error: None,
        last_update: None,
        files: Vec::new(),
    }
}

#[derive(Default)]
pub struct MockState {
    pub updates: Vec<Commit>,
    pub results: HashMap<i64, Vec<TestCaseResult>>,
    pub deletes: usize,
    pub fetches: usize,
}

/// In-memory data provider recording every write.
#[derive(Default)]
pub struct MockData {
    pub test_cases: Vec<TestCase>,
    pub exercise_files: Vec<String>,
    pub fail_test_cases: bool,
    /// Successive answers of `fetch_queued_commits`; `None` is a failure.
    pub batches: Mutex<VecDeque<Option<Vec<Commit>>>>,
    pub state: Mutex<MockState>,
}

impl MockData {
    pub fn new(test_cases: Vec<TestCase>) -> Self {
        Self {
            test_cases,
            ..Self::default()
        }
    }

    pub fn statuses(&self, commit_id: i64) -> Vec<CommitStatus> {
        self.state
            .lock()
            .updates
            .iter()
            .filter(|c| c.id == commit_id)
            .map(|c| c.status)
            .collect()
    }

    pub fn last_update(&self, commit_id: i64) -> Option<Commit> {
        self.state
            .lock()
            .updates
            .iter()
            .rev()
            .find(|c| c.id == commit_id)
            .cloned()
    }

    pub fn results(&self, commit_id: i64) -> Vec<TestCaseResult> {
        self.state
            .lock()
            .results
            .get(&commit_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DataProvider for MockData {
    async fn fetch_queued_commits(&self) -> Result<Vec<Commit>, DataError> {
        self.state.lock().fetches += 1;
        match self.batches.lock().pop_front() {
            Some(Some(commits)) => Ok(commits),
            Some(None) => Err(DataError::NotFound {
                table: "commits",
                id: 0,
            }),
            None => Ok(Vec::new()),
        }
    }

    async fn update_commit(&self, commit: &Commit) -> Result<(), DataError> {
        self.state.lock().updates.push(commit.clone());
        Ok(())
    }

    async fn fetch_test_cases(&self, commit: &Commit) -> Result<Vec<TestCase>, DataError> {
        if self.fail_test_cases {
            return Err(DataError::NotFound {
                table: "exercises",
                id: commit.real_exercise_id,
            });
        }
        Ok(self.test_cases.clone())
    }

    async fn fetch_exercise_files(&self, _commit: &Commit) -> Result<Vec<String>, DataError> {
        Ok(self.exercise_files.clone())
    }

    async fn store_test_results(
        &self,
        commit: &Commit,
        results: &[TestCaseResult],
    ) -> Result<(), DataError> {
        self.state
            .lock()
            .results
            .entry(commit.id)
            .or_default()
            .extend_from_slice(results);
        Ok(())
    }

    async fn delete_test_results(&self, commit: &Commit) -> Result<(), DataError> {
        let mut state = self.state.lock();
        state.results.remove(&commit.id);
        state.deletes += 1;
        Ok(())
    }
}

/// One action of a scripted container.
#[derive(Debug, Clone)]
pub enum Step {
    /// Print a line on stdout.
    Line(String),
    /// Write a file, relative to the mounted directory.
    Write(String, Vec<u8>),
    /// Fail unless the file exists in the mounted directory.
    Require(String),
    /// Stop printing without exiting.
    Hang,
}

pub fn line(text: &str) -> Step {
    Step::Line(text.to_string())
}

pub fn write(path: &str, content: &str) -> Step {
    Step::Write(path.to_string(), content.as_bytes().to_vec())
}

/// Compilation milestones, leaving `diagnostics` in the error file.
pub fn compilation(diagnostics: &str) -> Vec<Step> {
    vec![
        line("compilation.start"),
        write("compilation.err", diagnostics),
        line("compilation.done"),
    ]
}

/// Run milestones; each entry is (test case id, program output, signal).
pub fn run(outcomes: &[(i64, &str, &str)]) -> Vec<Step> {
    let mut steps = vec![line("run.start")];
    for (id, output, signal) in outcomes {
        steps.push(write(&format!("{id}.output"), output));
        steps.push(write(&format!("outputfiles/{id}.output"), output));
        steps.push(write(
            &format!("{id}.monitor_out"),
            &format!("time=0.01\nsignal={signal}\n"),
        ));
    }
    steps.push(line("run.done"));
    steps
}

/// Container runtime replaying the same script in every container.
#[derive(Default)]
pub struct ScriptedRuntime {
    script: Vec<Step>,
    /// Containers never stop on their own.
    fail_wait: bool,
    /// Containers cannot be killed.
    fail_kill: bool,
    pub launched: Mutex<Vec<String>>,
    pub killed: Arc<AtomicUsize>,
    pub removed: Arc<AtomicUsize>,
}

impl ScriptedRuntime {
    pub fn new(script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script,
            ..Self::default()
        })
    }

    /// Runtime whose containers fail to stop and, if `fail_kill`, to die.
    pub fn stuck(script: Vec<Step>, fail_kill: bool) -> Arc<Self> {
        Arc::new(Self {
            script,
            fail_wait: true,
            fail_kill,
            ..Self::default()
        })
    }

    pub fn killed(&self) -> usize {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn images(&self) -> Vec<String> {
        self.launched.lock().clone()
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn launch(
        &self,
        image: &str,
        host_dir: &Path,
        guest_dir: &str,
    ) -> Result<Box<dyn Container>, SandboxError> {
        assert_eq!(guest_dir, "/root");
        self.launched.lock().push(image.to_string());
        Ok(Box::new(ScriptedContainer {
            steps: self.script.iter().cloned().collect(),
            host_dir: host_dir.to_path_buf(),
            fail_wait: self.fail_wait,
            fail_kill: self.fail_kill,
            killed: self.killed.clone(),
            removed: self.removed.clone(),
        }))
    }
}

struct ScriptedContainer {
    steps: VecDeque<Step>,
    host_dir: PathBuf,
    fail_wait: bool,
    fail_kill: bool,
    killed: Arc<AtomicUsize>,
    removed: Arc<AtomicUsize>,
}

#[async_trait]
impl Container for ScriptedContainer {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn next_line(&mut self) -> Result<Option<String>, SandboxError> {
        while let Some(step) = self.steps.pop_front() {
            match step {
                Step::Line(text) => return Ok(Some(text)),
                Step::Write(path, content) => {
                    let path = self.host_dir.join(path);
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::write(path, content).await?;
                }
                Step::Require(path) => {
                    tokio::fs::metadata(self.host_dir.join(path)).await?;
                }
                Step::Hang => std::future::pending::<()>().await,
            }
        }
        Ok(None)
    }

    async fn wait(&mut self, timeout: Duration) -> Result<(), SandboxError> {
        if self.fail_wait {
            return Err(SandboxError::Runtime {
                command: "wait".to_string(),
                reason: format!("timed out after {} ms", timeout.as_millis()),
            });
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), SandboxError> {
        self.killed.fetch_add(1, Ordering::SeqCst);
        if self.fail_kill {
            return Err(SandboxError::Runtime {
                command: "kill".to_string(),
                reason: "daemon unreachable".to_string(),
            });
        }
        Ok(())
    }

    async fn remove(&mut self) -> Result<(), SandboxError> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Temporary execution directory and storage tree.
pub struct Fixture {
    pub dir: TempDir,
    pub config: EngineConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("exec")).unwrap();
        fs::create_dir_all(dir.path().join("storage")).unwrap();
        let config = EngineConfig {
            exec_dir: dir.path().join("exec"),
            compilation_timeout: Second(1.0),
            base_exec_timeout: Second(0.2),
            ..EngineConfig::default()
        };
        Self { dir, config }
    }

    pub fn storage_root(&self) -> PathBuf {
        self.dir.path().join("storage")
    }

    fn put(&self, rel: &str, content: &[u8]) {
        let path = self.storage_root().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pub fn put_submission(&self, commit: &Commit, content: &[u8]) {
        self.put(&format!("commits/{}", commit.storage_key), content);
    }

    pub fn put_case(&self, id: i64, input: &str, output: &str) {
        self.put(&format!("cases/{id}/in"), input.as_bytes());
        self.put(&format!("cases/{id}/out"), output.as_bytes());
    }

    pub fn put_case_file(&self, id: i64, name: &str, content: &str) {
        self.put(&format!("cases/{id}/files/{name}"), content.as_bytes());
    }

    pub fn put_exercise_file(&self, exercise_id: i64, name: &str, content: &str) {
        self.put(
            &format!("files/compilationfiles/{exercise_id}/{name}"),
            content.as_bytes(),
        );
    }

    pub fn storage(&self) -> StorageFactory {
        FilesystemStorage::factory(self.storage_root())
    }

    pub fn pipeline(&self, data: Arc<MockData>, runtime: Arc<ScriptedRuntime>) -> Pipeline {
        Pipeline::new(Arc::new(self.config.clone()), data, self.storage(), runtime)
    }

    pub fn work_dir(&self, commit_id: i64) -> PathBuf {
        self.config.exec_dir.join(format!("commit_{commit_id}"))
    }

    pub fn stored_archive(&self, commit_id: i64) -> PathBuf {
        self.storage_root()
            .join("outputfiles")
            .join(format!("{commit_id}.zip"))
    }
}

/// Zip archive holding `entries` as (name, content).
pub fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    for (name, content) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}
