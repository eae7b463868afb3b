//! Worker units.
//!
//! Every worker is a separate OS process running `grader worker`. The engine
//! process keeps the task queue and one supervisor per worker, which forwards
//! commits to its process and waits for the acknowledgement. Requests and
//! replies are JSON documents, one per line, on the process' stdin and
//! stdout. Grading never runs in the engine process: a worker that aborts or
//! runs out of memory loses the commit it held and nothing else.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;

use crate::config::Config;
use crate::model::{Commit, CommitStatus};
use crate::pipeline::Pipeline;
use crate::provider::DataProvider;
use crate::queue::{Task, TaskQueue};

mod process;

/// How long a worker process may take to exit once its input is closed.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

pub use process::{ProcessLauncher, worker_main};

/// Engine to worker.
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// First request of a worker process.
    Start { id: usize, config: Box<Config> },
    Grade { commit: Box<Commit> },
    Shutdown,
}

/// Worker to engine.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Ready,
    Done { commit_id: i64, status: CommitStatus },
}

/// Engine side of the pipes to one worker.
pub struct WorkerChannel {
    input: Box<dyn AsyncWrite + Send + Unpin>,
    output: Box<dyn AsyncBufRead + Send + Unpin>,
    process: Option<Child>,
}

impl WorkerChannel {
    pub fn new(
        input: impl AsyncWrite + Send + Unpin + 'static,
        output: impl AsyncBufRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            input: Box::new(input),
            output: Box::new(output),
            process: None,
        }
    }

    /// Ties the channel to the process at its other end, which is killed if
    /// the channel is dropped before [`finish`](Self::finish).
    pub fn with_process(mut self, process: Child) -> Self {
        self.process = Some(process);
        self
    }

    pub async fn send(&mut self, request: &Request) -> anyhow::Result<()> {
        write_message(&mut self.input, request).await
    }

    pub async fn receive(&mut self) -> anyhow::Result<Reply> {
        let mut line = String::new();
        if self.output.read_line(&mut line).await? == 0 {
            bail!("worker closed its output");
        }
        serde_json::from_str(&line).with_context(|| format!("Malformed reply {:?}", line.trim_end()))
    }

    /// Hands `commit` over and waits until it has been graded.
    async fn grade(&mut self, commit: &Commit) -> anyhow::Result<CommitStatus> {
        self.send(&Request::Grade {
            commit: Box::new(commit.clone()),
        })
        .await?;

        match self.receive().await? {
            Reply::Done { commit_id, status } if commit_id == commit.id => Ok(status),
            reply => bail!("expected the outcome of commit {}, got {reply:?}", commit.id),
        }
    }

    /// Closes the input and reaps the process, if any.
    async fn finish(self, id: usize) {
        let Self {
            mut input, process, ..
        } = self;
        let _ = input.shutdown().await;
        drop(input);

        let Some(mut process) = process else {
            return;
        };
        match tokio::time::timeout(REAP_TIMEOUT, process.wait()).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => log::warn!("Worker {id} process exited with {status}"),
            Ok(Err(e)) => log::error!("Failed to reap worker {id} process: {e}"),
            Err(_) => {
                log::error!("Worker {id} process did not exit; killing it");
                let _ = process.start_kill();
            }
        }
    }
}

/// Starts worker units.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Starts worker `id` and returns once it is ready to grade.
    async fn launch(&self, id: usize) -> anyhow::Result<WorkerChannel>;
}

/// Feeds worker `id` from `queue` until it receives [`Task::Shutdown`].
///
/// Every task is acknowledged. If the worker dies while grading, its commit
/// is recorded as `INTERNAL_ERROR` on a best-effort basis and this
/// supervisor ends with an error; the pool does not replace the worker.
pub async fn supervise(
    id: usize,
    launcher: Arc<dyn WorkerLauncher>,
    queue: Arc<TaskQueue>,
    data: Arc<dyn DataProvider>,
) -> anyhow::Result<()> {
    let mut channel = launcher
        .launch(id)
        .await
        .with_context(|| format!("Failed to start worker {id}"))?;
    log::info!("Worker {id} initialized");

    loop {
        let commit = match queue.pop().await {
            Task::Shutdown => {
                if let Err(e) = channel.send(&Request::Shutdown).await {
                    log::warn!("Worker {id} did not take the shutdown request: {e:#}");
                }
                channel.finish(id).await;
                queue.task_done();
                break;
            }
            Task::Commit(commit) => *commit,
        };

        let commit_id = commit.id;
        log::info!("Worker {id} got commit {commit_id} from queue");

        match channel.grade(&commit).await {
            Ok(status) => {
                log::debug!("Worker {id} finished commit {commit_id} ({status})");
                queue.task_done();
            }
            Err(e) => {
                log::error!("Worker {id} crashed on commit {commit_id}: {e:#}");
                record_crash(data.as_ref(), commit).await;
                queue.task_done();
                channel.finish(id).await;
                bail!("worker {id} stopped after a crash on commit {commit_id}");
            }
        }
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}

async fn record_crash(data: &dyn DataProvider, mut commit: Commit) {
    commit.advance(CommitStatus::InternalError);
    if let Err(e) = data.update_commit(&commit).await {
        log::error!("Failed to record internal error of commit {}: {e}", commit.id);
    }
}

/// Worker side: grades every commit received on `input`, replying on
/// `output`, until a shutdown request or the end of the input.
pub async fn serve<R, W>(id: usize, pipeline: &Pipeline, input: R, mut output: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let request: Request = serde_json::from_str(&line)
            .with_context(|| format!("Worker {id} got a malformed request"))?;

        match request {
            Request::Grade { commit } => {
                let commit_id = commit.id;
                let commit = pipeline.process_commit(*commit).await;
                let reply = Reply::Done {
                    commit_id,
                    status: commit.status,
                };
                write_message(&mut output, &reply).await?;
            }
            Request::Shutdown => {
                log::debug!("Worker {id} received shutdown request");
                return Ok(());
            }
            Request::Start { .. } => bail!("worker {id} was started twice"),
        }
    }

    log::warn!("Worker {id} input closed without a shutdown request");
    Ok(())
}

async fn write_message<W, T>(output: &mut W, message: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;
    Ok(())
}
