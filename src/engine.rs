//! The engine service object: container lifecycle plus the init/run
//! execution protocol.
//!
//! At most one managed container exists at a time; every mutation of the
//! handle funnels through [`LocalEngine::ensure`] and [`LocalEngine::kill`].
//! The engine assumes a single execution or debug session in flight — the
//! `&mut self` receivers document that constraint rather than enforcing it
//! with a lock.

use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::action::{ActionDescriptor, ExecutionResult, RuntimeKind};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::images::{image_installed, ImageResolver};
use crate::logs::LogCollector;
use crate::runtime::{ContainerRuntime, DockerCli};

/// How long to wait for an invocation's log batch before settling for none.
const LOG_BATCH_GRACE: Duration = Duration::from_secs(2);

/// What [`LocalEngine::ensure`] did to satisfy the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The current container already matched the requested kind.
    Reused,
    /// A new container was created (after tearing down any previous one).
    /// `pulled` marks the slow one-time image download phase.
    Created { pulled: bool },
}

/// The single live container handle.
pub(crate) struct ManagedContainer {
    pub(crate) id: String,
    pub(crate) kind: RuntimeKind,
    /// Code the container was last initialized with, compared by identity to
    /// skip redundant init calls.
    pub(crate) last_code: Option<String>,
    pub(crate) logs: Option<LogCollector>,
}

/// Local execution and debugging engine. Owns the managed container, the
/// cached image directory, and the HTTP client used against the container
/// API.
pub struct LocalEngine {
    pub(crate) cfg: EngineConfig,
    pub(crate) runtime: Box<dyn ContainerRuntime>,
    pub(crate) http: reqwest::Client,
    pub(crate) images: ImageResolver,
    pub(crate) container: Option<ManagedContainer>,
}

impl LocalEngine {
    pub fn new(cfg: EngineConfig, runtime: Box<dyn ContainerRuntime>) -> Result<Self> {
        // The runtime proxy may sit behind a self-signed certificate.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::Setup(e.to_string()))?;
        let images = ImageResolver::new(cfg.runtimes_endpoint.clone(), cfg.default_image.clone());
        Ok(Self {
            cfg,
            runtime,
            http,
            images,
            container: None,
        })
    }

    /// Engine backed by the docker CLI.
    pub fn with_docker(cfg: EngineConfig) -> Result<Self> {
        let docker = DockerCli::new()?;
        Self::new(cfg, Box::new(docker))
    }

    pub fn current_kind(&self) -> Option<&RuntimeKind> {
        self.container.as_ref().map(|c| &c.kind)
    }

    /// Guarantee a running container for `kind`, reusing the current one on
    /// an exact kind match and replacing it otherwise.
    pub async fn ensure(&mut self, kind: &RuntimeKind) -> Result<EnsureOutcome> {
        if let Some(c) = &self.container {
            if c.kind == *kind {
                debug!(%kind, "reusing the current container");
                return Ok(EnsureOutcome::Reused);
            }
        }

        // Best-effort teardown of whatever is in the way. A silent failure
        // here surfaces at create time as a name conflict.
        if let Err(e) = self.kill().await {
            debug!("pre-create teardown failed, continuing: {e}");
        }

        let image = self.images.resolve(kind).await?;
        let installed = self.runtime.installed_images().await?;
        let pulled = if image_installed(&installed, &image) {
            false
        } else {
            info!(%image, "pulling the runtime image");
            self.runtime.pull(&image).await?;
            true
        };

        info!(%image, name = %self.cfg.container_name, "starting a container");
        let id = self
            .runtime
            .create(
                &image,
                &self.cfg.container_name,
                self.cfg.api_port,
                self.cfg.debug_port,
            )
            .await?;
        self.runtime.start(&id).await?;

        let logs = match self.runtime.tail_logs(&id).await {
            Ok(tail) => Some(LogCollector::attach(tail)),
            Err(e) => {
                warn!("could not attach to the container log stream: {e}");
                None
            }
        };

        self.container = Some(ManagedContainer {
            id,
            kind: kind.clone(),
            last_code: None,
            logs,
        });
        Ok(EnsureOutcome::Created { pulled })
    }

    /// Stop and remove the managed container. With no handle held the named
    /// container may still exist after a crash; removal, not termination, is
    /// what lets a later create succeed, so a failed kill is tolerated when
    /// the remove goes through.
    pub async fn kill(&mut self) -> Result<()> {
        if let Some(c) = self.container.take() {
            debug!(id = %c.id, "stopping the managed container");
            self.runtime.stop(&c.id).await?;
            self.runtime.remove(&c.id).await?;
            return Ok(());
        }

        let name = self.cfg.container_name.clone();
        match self.runtime.kill_by_name(&name).await {
            Ok(()) => self.runtime.remove_by_name(&name).await,
            Err(kill_err) => match self.runtime.remove_by_name(&name).await {
                Ok(()) => {
                    debug!("kill-by-name failed ({kill_err}) but the remove succeeded");
                    Ok(())
                }
                Err(remove_err) => Err(Error::ContainerTeardownFailed {
                    name,
                    reason: format!("kill: {kill_err}; remove: {remove_err}"),
                }),
            },
        }
    }

    /// Initialize (unless the container already holds this exact code) and
    /// run the action, returning the result together with the log batch of
    /// this invocation.
    pub async fn run(
        &mut self,
        action: &ActionDescriptor,
        replayed: &Map<String, Value>,
        overrides: &Map<String, Value>,
    ) -> Result<ExecutionResult> {
        self.ensure(&action.kind).await?;

        // Reserve the log window before any output can arrive.
        let batch = self
            .container
            .as_ref()
            .and_then(|c| c.logs.as_ref())
            .map(|l| l.reserve());

        let warm = self
            .container
            .as_ref()
            .is_some_and(|c| c.last_code.as_deref() == Some(action.code.as_str()));

        let init_time_ms = if warm {
            debug!("container already initialized with this code, skipping init");
            None
        } else {
            info!(action = %action.name, "initializing the action in the container");
            let payload = json!({
                "value": {
                    "code": action.code,
                    "main": self.cfg.entry_point,
                    "binary": action.binary,
                }
            });
            let started = Instant::now();
            self.post("init", &payload).await?;
            if let Some(c) = self.container.as_mut() {
                c.last_code = Some(action.code.clone());
            }
            Some(started.elapsed().as_millis() as u64)
        };

        info!(action = %action.name, "running the action");
        let input = action.merged_input(replayed, overrides);
        let started = Instant::now();
        let result = self.post("run", &json!({ "value": Value::Object(input) })).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let logs = match batch {
            Some(b) => LogCollector::fetch(b, LOG_BATCH_GRACE).await,
            None => Vec::new(),
        };

        Ok(ExecutionResult {
            init_time_ms,
            duration_ms,
            result,
            logs,
        })
    }

    /// One init/run call against the container API. A network-layer failure
    /// likely means a wedged in-container process, so the container is torn
    /// down before the error propagates.
    async fn post(&mut self, phase: &'static str, body: &Value) -> Result<Value> {
        let url = format!("http://127.0.0.1:{}/{}", self.cfg.api_port, phase);
        let outcome = match self.http.post(&url).json(body).send().await {
            Ok(res) => res.json::<Value>().await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(v) => Ok(v),
            Err(e) => {
                if self.container.is_some() {
                    if let Err(kill_err) = self.kill().await {
                        warn!("teardown after a failed {phase} call also failed: {kill_err}");
                    }
                }
                Err(Error::ExecutionNetworkError {
                    phase,
                    reason: e.to_string(),
                })
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_image_directory(&mut self, dir: crate::images::ImageDirectory) {
        self.images.inject(dir);
    }
}
