use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};

use crate::error::SandboxError;

/// Something able to start containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Starts `image` detached, with `host_dir` bind-mounted read-write at
    /// `guest_dir`.
    async fn launch(
        &self,
        image: &str,
        host_dir: &Path,
        guest_dir: &str,
    ) -> Result<Box<dyn Container>, SandboxError>;
}

/// A started container.
#[async_trait]
pub trait Container: Send {
    fn id(&self) -> &str;

    /// Next line of the container's stdout, without its terminator.
    /// `None` once the stream has ended.
    async fn next_line(&mut self) -> Result<Option<String>, SandboxError>;

    /// Waits for the container to stop, failing if it takes longer than
    /// `timeout`.
    async fn wait(&mut self, timeout: Duration) -> Result<(), SandboxError>;

    async fn kill(&mut self) -> Result<(), SandboxError>;

    /// Removes the container, killing it first if still running.
    async fn remove(&mut self) -> Result<(), SandboxError>;
}

macro_rules! docker_command {
    ($($arg:expr),* $(,)?) => ({
        let mut cmd = Command::new("docker");
        $( cmd.arg($arg); )*
        cmd
    });
}

/// Runtime driving the `docker` command line client.
///
/// Every client call is bounded: `docker run` by `launch_timeout`, since it
/// may pull the image, and the teardown commands by `command_timeout`.
#[derive(Debug, Clone, Copy)]
pub struct DockerCli {
    launch_timeout: Duration,
    command_timeout: Duration,
}

impl DockerCli {
    pub fn new(launch_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            launch_timeout,
            command_timeout,
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn launch(
        &self,
        image: &str,
        host_dir: &Path,
        guest_dir: &str,
    ) -> Result<Box<dyn Container>, SandboxError> {
        let mut volume = host_dir.as_os_str().to_os_string();
        volume.push(":");
        volume.push(guest_dir);
        volume.push(":rw");

        let output = run_checked(
            docker_command!("run", "--detach", "--volume", volume, image),
            "run",
            self.launch_timeout,
        )
        .await?;
        let id = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        if id.is_empty() {
            return Err(SandboxError::Runtime {
                command: "run".to_string(),
                reason: "no container id printed".to_string(),
            });
        }
        log::debug!("Started container {id} from {image}");

        let mut logs = docker_command!("logs", "--follow", &id);
        logs.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut container = DockerContainer {
            id,
            command_timeout: self.command_timeout,
            logs: None,
            stdout: None,
        };
        // From here on the caller owns the container and tears it down
        match logs.spawn() {
            Ok(mut child) => {
                container.stdout = child.stdout.take().map(BufReader::new);
                container.logs = Some(child);
            }
            Err(e) => {
                log::error!("Failed to follow container {} output: {e}", container.id);
            }
        }
        Ok(Box::new(container))
    }
}

struct DockerContainer {
    id: String,
    command_timeout: Duration,
    logs: Option<Child>,
    stdout: Option<BufReader<ChildStdout>>,
}

#[async_trait]
impl Container for DockerContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn next_line(&mut self) -> Result<Option<String>, SandboxError> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };

        let mut buf = Vec::new();
        if stdout.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(None);
        }
        // Lossy: the container may print anything, only tokens matter
        Ok(Some(String::from_utf8_lossy(&buf).trim_end().to_string()))
    }

    async fn wait(&mut self, timeout: Duration) -> Result<(), SandboxError> {
        run_checked(docker_command!("wait", &self.id), "wait", timeout).await?;
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), SandboxError> {
        run_checked(docker_command!("kill", &self.id), "kill", self.command_timeout).await?;
        Ok(())
    }

    async fn remove(&mut self) -> Result<(), SandboxError> {
        if let Some(mut logs) = self.logs.take() {
            let _ = logs.start_kill();
        }
        self.stdout = None;
        run_checked(
            docker_command!("rm", "--force", &self.id),
            "rm",
            self.command_timeout,
        )
        .await?;
        log::debug!("Removed container {}", self.id);
        Ok(())
    }
}

/// Runs a client command to completion, killing it after `timeout`.
async fn run_checked(
    mut command: Command,
    name: &str,
    timeout: Duration,
) -> Result<std::process::Output, SandboxError> {
    command.stdin(Stdio::null()).kill_on_drop(true);
    let output = match tokio::time::timeout(timeout, command.output()).await {
        Err(_) => {
            return Err(SandboxError::Runtime {
                command: name.to_string(),
                reason: format!("timed out after {} ms", timeout.as_millis()),
            });
        }
        Ok(output) => output.map_err(|e| SandboxError::Runtime {
            command: name.to_string(),
            reason: e.to_string(),
        })?,
    };

    if !output.status.success() {
        return Err(SandboxError::Runtime {
            command: name.to_string(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_command_is_bounded() {
        let mut sleep = Command::new("sleep");
        sleep.arg("5");

        let started = std::time::Instant::now();
        let err = run_checked(sleep, "sleep", Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(4));
        match err {
            SandboxError::Runtime { command, reason } => {
                assert_eq!(command, "sleep");
                assert!(reason.contains("timed out"), "{reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_client_command_failure_reports_stderr() {
        let mut failing = Command::new("sh");
        failing.args(["-c", "echo 'no such container' >&2; exit 1"]);

        let err = run_checked(failing, "rm", Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            SandboxError::Runtime { command, reason } => {
                assert_eq!(command, "rm");
                assert_eq!(reason, "no such container");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
