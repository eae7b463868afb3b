use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(name = "grader", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file; defaults and environment variables
    /// are used when omitted
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<PathBuf>,

    /// Number of workers, overriding the configuration file
    #[arg(long = "workers", short = 'w')]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Grade the commits sent by the engine on stdin; spawned once per worker
    #[command(hide = true)]
    Worker,
}

impl CliArgs {
    /// Load the configuration from the specified file, or from the
    /// environment if no file was given
    pub fn to_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => {
                let file = std::fs::File::open(path)?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader)?
            }
            None => Config::from_env(),
        };

        if let Some(workers) = self.workers {
            config.engine.num_workers = workers;
        }
        if config.engine.num_workers == 0 {
            anyhow::bail!("The number of workers must not be 0");
        }
        Ok(config)
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Defaults, with a few locations overridable through the environment
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Ok(url) = std::env::var("GRADER_DATABASE_URL") {
            config.database.url = Some(url);
        }
        if let Ok(root) = std::env::var("GRADER_STORAGE_ROOT") {
            config.storage.root = root.into();
        }
        if let Ok(dir) = std::env::var("GRADER_EXEC_DIR") {
            config.engine.exec_dir = dir.into();
        }
        if let Ok(dir) = std::env::var("GRADER_EXEC_DIR_REMOTE") {
            config.engine.exec_dir_remote = Some(dir.into());
        }
        config
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub num_workers: usize,
    pub min_sleep_time: Second,
    pub max_sleep_time: Second,
    pub backoff_steps: u32,
    /// Where working directories are created
    pub exec_dir: PathBuf,
    /// `exec_dir` as seen by the container daemon, when it differs
    pub exec_dir_remote: Option<PathBuf>,
    /// Mount point of the working directory inside the container
    pub guest_dir: String,
    pub image_template: String,
    pub src_dir: String,
    pub output_files_dir: String,
    pub max_output_file_size: ByteSize,
    pub compilation_error_file: String,
    pub container_cfg_file: String,
    pub compilation_timeout: Second,
    pub base_exec_timeout: Second,
    /// Bound on starting a container, image pull included
    pub launch_timeout: Second,
    pub monitor_max_file_size: ByteSize,
    pub monitor_max_mem_size: ByteSize,
    pub cleanup_on_error: bool,
    pub lock_file: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            min_sleep_time: Second(1.0),
            max_sleep_time: Second(15.0),
            backoff_steps: 10,
            exec_dir: std::env::temp_dir(),
            exec_dir_remote: None,
            guest_dir: "/root".to_string(),
            image_template: "compiler-images-{language}:latest".to_string(),
            src_dir: "src".to_string(),
            output_files_dir: "outputfiles".to_string(),
            max_output_file_size: ByteSize(1 << 20),
            compilation_error_file: "compilation.err".to_string(),
            container_cfg_file: "container.config".to_string(),
            compilation_timeout: Second(10.0),
            base_exec_timeout: Second(5.0),
            launch_timeout: Second(300.0),
            monitor_max_file_size: ByteSize(5 << 20),
            monitor_max_mem_size: ByteSize(256 << 20),
            cleanup_on_error: false,
            lock_file: PathBuf::from("grader.lock"),
        }
    }
}

impl EngineConfig {
    pub fn exec_dir_remote(&self) -> &PathBuf {
        self.exec_dir_remote.as_ref().unwrap_or(&self.exec_dir)
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection string; a file in the local data directory if unset
    pub url: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("storage"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Second(pub f64);

impl Second {
    /// Negative or NaN amounts give zero; amounts too large for a
    /// [`Duration`] saturate.
    pub fn as_duration(self) -> Duration {
        saturating_secs(self.0)
    }
}

pub fn saturating_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);
