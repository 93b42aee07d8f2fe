//! Container engine boundary.
//!
//! The engine mixes a structured call surface with operations that only the
//! docker CLI conveniently exposes (copy-into-container, exec with streamed
//! output, kill/remove by name), so the whole boundary shells out through
//! [`tokio::process::Command`] behind the [`ContainerRuntime`] trait.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use which::which;

use crate::action::LogLine;
use crate::config::{CONTAINER_API_PORT, CONTAINER_DEBUG_PORT};
use crate::error::{Error, Result};

/// Long-lived line subscription to a container's combined stdout/stderr.
/// The channel closes when the underlying log stream ends.
pub struct LogTail {
    pub lines: mpsc::UnboundedReceiver<LogLine>,
}

/// One line from a streamed in-container exec, tagged with its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecLine {
    Stdout(String),
    Stderr(String),
}

/// A long-running in-container process with its output delivered
/// line-by-line. Dropping the stream does not terminate the process.
pub struct ExecStream {
    pub lines: mpsc::UnboundedReceiver<ExecLine>,
    _child: Option<tokio::process::Child>,
}

impl ExecStream {
    pub fn new(
        lines: mpsc::UnboundedReceiver<ExecLine>,
        child: Option<tokio::process::Child>,
    ) -> Self {
        Self {
            lines,
            _child: child,
        }
    }
}

/// Operations the engine needs from the container engine. Implemented by
/// [`DockerCli`]; tests substitute a recording mock so the lifecycle
/// properties can be checked without docker.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Locally installed images as `repository:tag` labels.
    async fn installed_images(&self) -> Result<Vec<String>>;

    async fn pull(&self, image: &str) -> Result<()>;

    /// Create a container bound to the two fixed host ports; returns the
    /// container id.
    async fn create(
        &self,
        image: &str,
        name: &str,
        api_port: u16,
        debug_port: u16,
    ) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str) -> Result<()>;

    /// Force-remove by id.
    async fn remove(&self, id: &str) -> Result<()>;

    async fn kill_by_name(&self, name: &str) -> Result<()>;

    async fn remove_by_name(&self, name: &str) -> Result<()>;

    /// Copy the contents of a host directory into the container.
    async fn copy_in(&self, name: &str, host_dir: &Path, container_dir: &str) -> Result<()>;

    /// Copy a file out of the container to a host path.
    async fn copy_out(&self, name: &str, container_path: &str, host_path: &Path) -> Result<()>;

    /// Execute a command inside the container, streaming its output.
    async fn exec_streamed(&self, name: &str, cmd: &[String]) -> Result<ExecStream>;

    /// Attach a line tail to the container's combined output stream.
    async fn tail_logs(&self, id: &str) -> Result<LogTail>;
}

/// [`ContainerRuntime`] backed by the docker CLI.
pub struct DockerCli;

impl DockerCli {
    pub fn new() -> Result<Self> {
        if which("docker").is_err() {
            return Err(Error::ContainerEngine(
                "docker not found on PATH".to_string(),
            ));
        }
        Ok(Self)
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let out = Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::ContainerEngine(format!("spawning docker {}: {e}", args[0])))?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).to_string())
        } else {
            Err(Error::ContainerEngine(format!(
                "docker {} failed: {}",
                args[0],
                String::from_utf8_lossy(&out.stderr).trim()
            )))
        }
    }
}

/// Whether a `docker create` stderr indicates the fixed name is still taken.
pub(crate) fn is_name_conflict(stderr: &str) -> bool {
    stderr.contains("is already in use by container")
        || stderr.contains("Conflict. The container name")
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn installed_images(&self) -> Result<Vec<String>> {
        let out = self
            .run(&["image", "ls", "--format", "{{.Repository}}:{{.Tag}}"])
            .await?;
        Ok(out.lines().map(|l| l.trim().to_string()).collect())
    }

    async fn pull(&self, image: &str) -> Result<()> {
        self.run(&["pull", image]).await?;
        Ok(())
    }

    async fn create(
        &self,
        image: &str,
        name: &str,
        api_port: u16,
        debug_port: u16,
    ) -> Result<String> {
        let api = format!("{api_port}:{CONTAINER_API_PORT}");
        let debug = format!("{debug_port}:{CONTAINER_DEBUG_PORT}");
        let out = Command::new("docker")
            .args(["create", "--name", name, "-p", &api, "-p", &debug, image])
            .output()
            .await
            .map_err(|e| Error::ContainerEngine(format!("spawning docker create: {e}")))?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&out.stderr);
            if is_name_conflict(&stderr) {
                Err(Error::ContainerNameConflict {
                    name: name.to_string(),
                })
            } else {
                Err(Error::ContainerEngine(format!(
                    "docker create failed: {}",
                    stderr.trim()
                )))
            }
        }
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.run(&["start", id]).await?;
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.run(&["stop", id]).await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.run(&["rm", "-f", id]).await?;
        Ok(())
    }

    async fn kill_by_name(&self, name: &str) -> Result<()> {
        self.run(&["kill", name]).await?;
        Ok(())
    }

    async fn remove_by_name(&self, name: &str) -> Result<()> {
        self.run(&["rm", name]).await?;
        Ok(())
    }

    async fn copy_in(&self, name: &str, host_dir: &Path, container_dir: &str) -> Result<()> {
        // `dir/.` copies the directory contents rather than the directory.
        let src = format!("{}/.", host_dir.display());
        let dst = format!("{name}:{container_dir}");
        self.run(&["cp", &src, &dst]).await?;
        Ok(())
    }

    async fn copy_out(&self, name: &str, container_path: &str, host_path: &Path) -> Result<()> {
        let src = format!("{name}:{container_path}");
        let dst = host_path.display().to_string();
        self.run(&["cp", &src, &dst]).await?;
        Ok(())
    }

    async fn exec_streamed(&self, name: &str, cmd: &[String]) -> Result<ExecStream> {
        let mut child = Command::new("docker")
            .arg("exec")
            .arg(name)
            .args(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ContainerEngine(format!("spawning docker exec: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ContainerEngine("docker exec stdout not piped".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::ContainerEngine("docker exec stderr not piped".into()))?;

        let (tx, rx) = mpsc::unbounded_channel();

        let tx_out = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx_out.send(ExecLine::Stdout(line)).is_err() {
                    break;
                }
            }
        });
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(ExecLine::Stderr(line)).is_err() {
                    break;
                }
            }
        });

        Ok(ExecStream::new(rx, Some(child)))
    }

    async fn tail_logs(&self, id: &str) -> Result<LogTail> {
        let mut child = Command::new("docker")
            .args(["logs", "--follow", id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ContainerEngine(format!("spawning docker logs: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ContainerEngine("docker logs stdout not piped".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::ContainerEngine("docker logs stderr not piped".into()))?;

        let (tx, rx) = mpsc::unbounded_channel();

        let tx_out = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx_out.send(LogLine::stdout(line)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    // Stream errors become log records; the subscription
                    // itself keeps listening.
                    Err(e) => {
                        let _ = tx_out.send(LogLine::error(e.to_string()));
                    }
                }
            }
        });
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(LogLine::stderr(line)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(LogLine::error(e.to_string()));
                    }
                }
            }
            // Keep the logs process from lingering once both pumps are done.
            let _ = child.kill().await;
        });

        Ok(LogTail { lines: rx })
    }
}
