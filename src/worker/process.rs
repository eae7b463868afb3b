use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::config::Config;
use crate::database::{self as db, SqliteDataProvider};
use crate::pipeline::Pipeline;
use crate::provider::FilesystemStorage;
use crate::sandbox::DockerCli;

use super::{Reply, Request, WorkerChannel, WorkerLauncher, serve, write_message};

/// Starts workers by running `<program> worker` with piped stdin and stdout.
///
/// The program gets its whole configuration in the start request, so every
/// worker grades with the settings the engine resolved.
pub struct ProcessLauncher {
    program: PathBuf,
    config: Config,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            program: program.into(),
            config,
        }
    }

    /// Launcher re-running the executable of this process.
    pub fn current_exe(config: Config) -> anyhow::Result<Self> {
        let program = std::env::current_exe().context("Unable to locate the grader executable")?;
        Ok(Self::new(program, config))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, id: usize) -> anyhow::Result<WorkerChannel> {
        let mut child = Command::new(&self.program)
            .arg("worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to run {}", self.program.display()))?;
        log::debug!("Worker {id} runs as process {:?}", child.id());

        let stdin = child.stdin.take().context("worker stdin is not piped")?;
        let stdout = child.stdout.take().context("worker stdout is not piped")?;
        let mut channel = WorkerChannel::new(stdin, BufReader::new(stdout)).with_process(child);

        channel
            .send(&Request::Start {
                id,
                config: Box::new(self.config.clone()),
            })
            .await?;
        match channel.receive().await? {
            Reply::Ready => Ok(channel),
            reply => bail!("expected worker {id} to be ready, got {reply:?}"),
        }
    }
}

/// Entry point of `grader worker`.
///
/// Reads the start request on stdin, opens its own database pool and
/// storage, then grades until told to stop. Interrupts are ignored: the
/// engine decides when workers stop.
pub async fn worker_main() -> anyhow::Result<()> {
    // SAFETY: only changes the disposition of SIGINT, no handler runs
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
    }

    let mut input = BufReader::new(tokio::io::stdin());
    let mut output = tokio::io::stdout();

    let mut line = String::new();
    if input.read_line(&mut line).await? == 0 {
        bail!("the engine closed the worker input before starting it");
    }
    let Request::Start { id, config } =
        serde_json::from_str::<Request>(&line).context("Malformed start request")?
    else {
        bail!("the first request to a worker must start it");
    };

    let pipeline = open_pipeline(*config)
        .await
        .with_context(|| format!("Worker {id} failed to initialize"))?;
    write_message(&mut output, &Reply::Ready).await?;
    log::debug!("Worker {id} ready in process {}", std::process::id());

    serve(id, &pipeline, input, output).await
}

async fn open_pipeline(config: Config) -> anyhow::Result<Pipeline> {
    let db_url = db::resolve_db_url(&config.database)?;
    let db_pool = db::init_db(&db_url)
        .await
        .context("Failed to initialize database")?;
    let data = Arc::new(SqliteDataProvider::new(db_pool));

    FilesystemStorage::open(&config.storage.root)?;
    let storage = FilesystemStorage::factory(&config.storage.root);

    let engine = config.engine;
    let runtime = DockerCli::new(
        engine.launch_timeout.as_duration(),
        engine.base_exec_timeout.as_duration(),
    );
    Ok(Pipeline::new(Arc::new(engine), data, storage, Arc::new(runtime)))
}
