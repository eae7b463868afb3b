use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use grader::config::{CliArgs, Command};
use grader::database::{self as db, SqliteDataProvider};
use grader::lock::InstanceLock;
use grader::poller::{Backoff, Poller, accept_all};
use grader::provider::{DataProvider, FilesystemStorage};
use grader::queue::{Task, TaskQueue};
use grader::worker::{ProcessLauncher, WorkerLauncher, supervise, worker_main};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    if cli.command == Some(Command::Worker) {
        return worker_main().await;
    }
    let mut config = cli.to_config().context("Failed to load configuration")?;

    let _lock = InstanceLock::acquire(&config.engine.lock_file)?;
    log::info!("Started");
    log::debug!("Configuration: {config:?}");

    // Workers must open the same database
    let db_url = db::resolve_db_url(&config.database)?;
    config.database.url = Some(db_url.clone());
    let db_pool = db::init_db(&db_url)
        .await
        .context("Failed to initialize database")?;
    let data: Arc<dyn DataProvider> = Arc::new(SqliteDataProvider::new(db_pool));

    // Fail early on a misconfigured storage root
    FilesystemStorage::open(&config.storage.root)?;

    let engine = config.engine.clone();
    let launcher: Arc<dyn WorkerLauncher> = Arc::new(ProcessLauncher::current_exe(config)?);
    let queue = Arc::new(TaskQueue::new());
    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let mut workers = JoinSet::new();
    for i in 1..=engine.num_workers {
        workers.spawn(supervise(i, launcher.clone(), queue.clone(), data.clone()));
    }

    let poller = Poller::new(
        data,
        queue.clone(),
        accept_all(),
        Backoff::new(
            engine.min_sleep_time.as_duration(),
            engine.max_sleep_time.as_duration(),
            engine.backoff_steps,
        ),
    );
    let mut poller_task = tokio::spawn(poller.run(shutdown_token.clone()));

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    let poller_done = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted; waiting for workers");
            false
        }
        res_poller = &mut poller_task => {
            log::error!("Poller terminated unexpectedly: {res_poller:?}");
            true
        }
    };

    // 1. Stop queueing new work
    shutdown_token.cancel();
    if !poller_done {
        if let Err(e) = poller_task.await {
            log::error!("Poller task failed: {e:?}");
        }
    }

    // 2. One sentinel per live worker
    for _ in 0..workers.len() {
        queue.push(Task::Shutdown);
    }

    // 3. Wait until every worker terminates; a second interrupt kills them
    loop {
        tokio::select! {
            res = workers.join_next() => match res {
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => log::error!("Worker finished with error: {e:#}"),
                Some(Err(e)) if e.is_panic() => log::error!("Worker handle panicked: {e:?}"),
                Some(Err(e)) => log::error!("Worker handle finished with error: {e:?}"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("Aborted");
                workers.abort_all();
                while workers.join_next().await.is_some() {}
                break;
            }
        }
    }

    log::info!("Exited");
    Ok(())
}
