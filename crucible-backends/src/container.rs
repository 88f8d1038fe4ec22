//! Ephemeral-container backend driven by a container daemon.
//!
//! Each invocation creates a short-lived container from the configured
//! image, waits for completion (raced against the timeout and the caller's
//! cancellation), captures its output, and force-removes the container
//! afterwards regardless of outcome.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, LogsOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, WaitContainerOptions,
};
use crucible_catalog::ToolLookup;
use crucible_primitives::{BackendKind, ExecutionResult, ExecutionSpec, ToolId};
use futures::{StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::contract::{Backend, Health, tools_for_kind};
use crate::error::{BackendError, BackendResult};
use crate::invocation::{Invocation, InvocationEvent};

/// Configuration for the container backend.
#[derive(Clone, Debug)]
pub struct ContainerConfig {
    /// Image every invocation container is created from.
    pub image: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "alpine:3".to_owned(),
        }
    }
}

/// Backend running specs inside ephemeral containers.
pub struct ContainerBackend {
    name: String,
    config: ContainerConfig,
    catalog: Arc<dyn ToolLookup>,
    docker: RwLock<Option<Docker>>,
}

impl ContainerBackend {
    /// Creates a container backend over the supplied catalog. The daemon
    /// connection is acquired in [`Backend::start`].
    #[must_use]
    pub fn new(config: ContainerConfig, catalog: Arc<dyn ToolLookup>) -> Self {
        Self {
            name: "container".to_owned(),
            config,
            catalog,
            docker: RwLock::new(None),
        }
    }

    fn connection(&self) -> BackendResult<Docker> {
        self.docker
            .read()
            .expect("docker connection poisoned")
            .clone()
            .ok_or_else(|| {
                BackendError::unavailable(BackendKind::Container, "backend not started")
            })
    }

    async fn ensure_image(&self, docker: &Docker) -> BackendResult<()> {
        if docker.inspect_image(&self.config.image).await.is_ok() {
            return Ok(());
        }

        let (from_image, tag) = match self.config.image.rsplit_once(':') {
            Some((image, tag)) => (image, tag),
            None => (self.config.image.as_str(), "latest"),
        };
        debug!(image = %self.config.image, "pulling container image");
        docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|source| BackendError::Spawn {
                reason: format!("failed to pull image `{}`: {source}", self.config.image),
            })?;
        Ok(())
    }

    fn exit_code(status_code: i64) -> i32 {
        i32::try_from(status_code).unwrap_or(if status_code < 0 { i32::MIN } else { i32::MAX })
    }

    /// Create → start → wait → logs, without removal; the caller removes the
    /// container in every outcome, which also kills it on timeout/cancel.
    async fn run_in_container(
        &self,
        docker: &Docker,
        container: &str,
        spec: &ExecutionSpec,
        cancel: &CancellationToken,
        invocation: &mut Invocation,
    ) -> BackendResult<(i64, Vec<u8>, Vec<u8>)> {
        self.ensure_image(docker).await?;

        let env: Vec<String> = spec
            .env()
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        let memory = spec
            .envelope()
            .memory_bytes()
            .map(|bytes| i64::try_from(bytes).unwrap_or(i64::MAX));
        let body = ContainerCreateBody {
            image: Some(self.config.image.clone()),
            cmd: Some(spec.argv().to_vec()),
            env: if env.is_empty() { None } else { Some(env) },
            host_config: Some(HostConfig {
                memory,
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(container).build()),
                body,
            )
            .await
            .map_err(|source| BackendError::Spawn {
                reason: format!("failed to create container: {source}"),
            })?;

        docker
            .start_container(container, None::<StartContainerOptions>)
            .await
            .map_err(|source| BackendError::Spawn {
                reason: format!("failed to start container: {source}"),
            })?;
        invocation.transition(InvocationEvent::Launch)?;

        let mut wait = docker.wait_container(container, None::<WaitContainerOptions>);
        let status_code = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                invocation.transition(InvocationEvent::Cancel)?;
                return Err(BackendError::Cancelled);
            }
            () = Self::deadline(spec.timeout()) => {
                invocation.transition(InvocationEvent::Expire)?;
                return Err(BackendError::Timeout { elapsed: invocation.elapsed() });
            }
            response = wait.next() => match response {
                Some(Ok(response)) => response.status_code,
                // The daemon reports nonzero exits through the wait error
                // channel when an error detail is attached.
                Some(Err(BollardError::DockerContainerWaitError { code, .. })) => code,
                Some(Err(source)) => {
                    return Err(BackendError::execution(format!(
                        "failed to await container: {source}"
                    )));
                }
                None => {
                    return Err(BackendError::execution(
                        "container wait stream ended without a status",
                    ));
                }
            },
        };

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut logs = docker.logs(
            container,
            Some(LogsOptionsBuilder::new().stdout(true).stderr(true).build()),
        );
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                    stdout.extend_from_slice(&message);
                }
                Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                Ok(LogOutput::StdIn { .. }) => {}
                Err(source) => {
                    return Err(BackendError::execution(format!(
                        "failed to read container logs: {source}"
                    )));
                }
            }
        }

        Ok((status_code, stdout, stderr))
    }

    async fn deadline(timeout: Option<std::time::Duration>) {
        match timeout {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    }

    /// Force-removes the invocation container, tolerating "not found".
    async fn remove_quietly(docker: &Docker, container: &str) {
        let result = docker
            .remove_container(
                container,
                Some(
                    RemoveContainerOptionsBuilder::new()
                        .force(true)
                        .v(true)
                        .build(),
                ),
            )
            .await;
        match result {
            Ok(()) => {}
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(source) => {
                warn!(container, error = %source, "failed to remove invocation container");
            }
        }
    }
}

#[async_trait]
impl Backend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn start(&self) -> BackendResult<()> {
        if self
            .docker
            .read()
            .expect("docker connection poisoned")
            .is_some()
        {
            return Ok(());
        }

        let docker = Docker::connect_with_local_defaults().map_err(|source| {
            BackendError::unavailable(
                BackendKind::Container,
                format!("failed to connect to container daemon: {source}"),
            )
        })?;
        docker.ping().await.map_err(|source| {
            BackendError::unavailable(
                BackendKind::Container,
                format!("container daemon did not answer ping: {source}"),
            )
        })?;

        *self.docker.write().expect("docker connection poisoned") = Some(docker);
        Ok(())
    }

    async fn stop(&self) -> BackendResult<()> {
        // Dropping the client closes the daemon connection; repeated stops
        // are no-ops.
        self.docker
            .write()
            .expect("docker connection poisoned")
            .take();
        Ok(())
    }

    async fn health(&self) -> Health {
        let connection = self
            .docker
            .read()
            .expect("docker connection poisoned")
            .clone();
        match connection {
            None => Health::Unknown,
            Some(docker) => match docker.ping().await {
                Ok(_) => Health::Healthy,
                Err(source) => Health::Unhealthy {
                    reason: source.to_string(),
                },
            },
        }
    }

    async fn list_tools(&self) -> BackendResult<Vec<ToolId>> {
        Ok(tools_for_kind(self.catalog.as_ref(), self.kind()))
    }

    async fn execute(
        &self,
        spec: &ExecutionSpec,
        cancel: CancellationToken,
    ) -> BackendResult<ExecutionResult> {
        if !spec.stdin().is_empty() {
            return Err(BackendError::execution(
                "container invocations receive input through arguments, not stdin",
            ));
        }
        if spec.argv().is_empty() {
            return Err(BackendError::Spawn {
                reason: "container invocation requires a non-empty argv".into(),
            });
        }

        let docker = self.connection()?;
        let mut invocation = Invocation::new();
        invocation.transition(InvocationEvent::Start)?;
        let container = format!("crucible-{}", Uuid::new_v4());

        let outcome = self
            .run_in_container(&docker, &container, spec, &cancel, &mut invocation)
            .await;
        // Tear-down runs in every outcome, including wait errors; a forced
        // remove also kills a still-running container.
        Self::remove_quietly(&docker, &container).await;

        let (status_code, stdout, stderr) = outcome?;
        invocation.transition(InvocationEvent::Succeed)?;
        debug!(
            backend = %self.kind(),
            container,
            exit_code = Self::exit_code(status_code),
            "container invocation complete"
        );

        Ok(ExecutionResult::new(
            Self::exit_code(status_code),
            stdout,
            stderr,
            invocation.elapsed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_catalog::ToolCatalog;
    use std::time::Duration;

    fn backend() -> ContainerBackend {
        ContainerBackend::new(ContainerConfig::default(), Arc::new(ToolCatalog::new()))
    }

    #[tokio::test]
    async fn execute_before_start_is_unavailable() {
        let backend = backend();
        let spec = ExecutionSpec::builder()
            .argv(["echo", "hi"])
            .timeout(Duration::from_secs(1))
            .build()
            .unwrap();

        let err = backend
            .execute(&spec, CancellationToken::new())
            .await
            .expect_err("not started");
        assert!(matches!(err, BackendError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn stdin_bearing_specs_are_rejected() {
        let backend = backend();
        let spec = ExecutionSpec::builder()
            .argv(["cat"])
            .stdin(bytes::Bytes::from_static(b"data"))
            .build()
            .unwrap();

        let err = backend
            .execute(&spec, CancellationToken::new())
            .await
            .expect_err("stdin unsupported");
        assert!(matches!(err, BackendError::Execution { .. }));
    }

    #[tokio::test]
    async fn stop_is_idempotent_without_start() {
        let backend = backend();
        backend.stop().await.unwrap();
        backend.stop().await.unwrap();
    }

    #[tokio::test]
    async fn health_is_unknown_before_start() {
        let backend = backend();
        assert_eq!(backend.health().await, Health::Unknown);
    }

    #[test]
    fn exit_codes_saturate() {
        assert_eq!(ContainerBackend::exit_code(42), 42);
        assert_eq!(ContainerBackend::exit_code(i64::MAX), i32::MAX);
        assert_eq!(ContainerBackend::exit_code(i64::MIN), i32::MIN);
    }

    #[test]
    fn streaming_is_not_supported() {
        assert!(!backend().supports_streaming());
    }
}
