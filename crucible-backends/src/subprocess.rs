//! Unconfined local-process backend.
//!
//! Runs the spec's argv directly on the host with no resource isolation
//! beyond the invocation timeout. The invoked code has **unrestricted host
//! access**: this backend exists for low-latency trusted development and is
//! never bound to the standard trust profile.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use crucible_catalog::ToolLookup;
use crucible_primitives::{
    BackendKind, ExecutionResult, ExecutionSpec, OutputStream, StreamErrorCause, ToolId,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::contract::{Backend, Health, tools_for_kind};
use crate::error::{BackendError, BackendResult};
use crate::invocation::{Invocation, InvocationEvent};
use crate::stream::{EventSender, EventSource};

/// Backend running specs as plain OS processes.
pub struct SubprocessBackend {
    name: String,
    catalog: Arc<dyn ToolLookup>,
}

impl SubprocessBackend {
    /// Creates a subprocess backend over the supplied catalog.
    #[must_use]
    pub fn new(catalog: Arc<dyn ToolLookup>) -> Self {
        Self {
            name: "subprocess".to_owned(),
            catalog,
        }
    }

    fn spawn(spec: &ExecutionSpec) -> BackendResult<Child> {
        let argv = spec.argv();
        let Some((program, args)) = argv.split_first() else {
            return Err(BackendError::Spawn {
                reason: "subprocess invocation requires a non-empty argv".into(),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(spec.env().iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn().map_err(|source| BackendError::Spawn {
            reason: format!("failed to spawn `{program}`: {source}"),
        })
    }

    fn feed_stdin(child: &mut Child, input: Bytes) {
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                let _ = stdin.write_all(&input).await;
                // Dropping closes the pipe and signals EOF.
            });
        }
    }

    fn capture(reader: Option<impl AsyncRead + Unpin + Send + 'static>) -> JoinHandle<Vec<u8>> {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut reader) = reader {
                let _ = reader.read_to_end(&mut buf).await;
            }
            buf
        })
    }

    /// Kills the child's whole process group, then reaps it.
    async fn kill(child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id()
            && let Ok(raw) = i32::try_from(pid)
        {
            let _ = nix::sys::signal::killpg(
                nix::unistd::Pid::from_raw(raw),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
        let _ = child.start_kill();
        let _ = child.wait().await;
    }

    async fn deadline(timeout: Option<Duration>) {
        match timeout {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    }

    fn exit_code(status: std::process::ExitStatus) -> i32 {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return 128 + signal;
            }
        }
        status.code().unwrap_or(-1)
    }

    async fn forward(
        reader: Option<impl AsyncRead + Unpin + Send + 'static>,
        sender: EventSender,
        stream: OutputStream,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let Some(mut reader) = reader else { return };
            let mut buf = vec![0u8; 8192];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if !sender.output(stream, Bytes::copy_from_slice(&buf[..n])).await {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Backend for SubprocessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Subprocess
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn start(&self) -> BackendResult<()> {
        // No external dependency to acquire.
        Ok(())
    }

    async fn stop(&self) -> BackendResult<()> {
        Ok(())
    }

    async fn health(&self) -> Health {
        Health::Healthy
    }

    async fn list_tools(&self) -> BackendResult<Vec<ToolId>> {
        Ok(tools_for_kind(self.catalog.as_ref(), self.kind()))
    }

    async fn execute(
        &self,
        spec: &ExecutionSpec,
        cancel: CancellationToken,
    ) -> BackendResult<ExecutionResult> {
        let mut invocation = Invocation::new();
        invocation.transition(InvocationEvent::Start)?;

        let mut child = Self::spawn(spec)?;
        Self::feed_stdin(&mut child, spec.stdin().clone());
        let stdout_task = Self::capture(child.stdout.take());
        let stderr_task = Self::capture(child.stderr.take());
        invocation.transition(InvocationEvent::Launch)?;

        let status = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                Self::kill(&mut child).await;
                invocation.transition(InvocationEvent::Cancel)?;
                return Err(BackendError::Cancelled);
            }
            () = Self::deadline(spec.timeout()) => {
                Self::kill(&mut child).await;
                invocation.transition(InvocationEvent::Expire)?;
                return Err(BackendError::Timeout {
                    elapsed: invocation.elapsed(),
                });
            }
            status = child.wait() => status?,
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        invocation.transition(InvocationEvent::Succeed)?;
        debug!(
            backend = %self.kind(),
            exit_code = Self::exit_code(status),
            elapsed_ms = invocation.elapsed().as_millis() as u64,
            "subprocess invocation complete"
        );

        Ok(ExecutionResult::new(
            Self::exit_code(status),
            stdout,
            stderr,
            invocation.elapsed(),
        ))
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn execute_stream(
        &self,
        spec: &ExecutionSpec,
        cancel: CancellationToken,
    ) -> BackendResult<EventSource> {
        let mut child = Self::spawn(spec)?;
        Self::feed_stdin(&mut child, spec.stdin().clone());

        let guard = cancel.child_token();
        let (source, sender) = EventSource::channel(guard);
        let timeout = spec.timeout();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        tokio::spawn(async move {
            let out_task = Self::forward(stdout, sender.clone(), OutputStream::Stdout).await;
            let err_task = Self::forward(stderr, sender.clone(), OutputStream::Stderr).await;

            let outcome = tokio::select! {
                biased;
                () = sender.guard().cancelled() => {
                    Self::kill(&mut child).await;
                    Err(StreamErrorCause::Cancelled)
                }
                () = Self::deadline(timeout) => {
                    Self::kill(&mut child).await;
                    Err(StreamErrorCause::Timeout)
                }
                status = child.wait() => status.map_err(|_| StreamErrorCause::Execution),
            };

            // Drain the forwarders so the terminal event is last.
            let _ = out_task.await;
            let _ = err_task.await;

            match outcome {
                Ok(status) => sender.exit(Self::exit_code(status)).await,
                Err(StreamErrorCause::Cancelled) => {
                    sender
                        .error(StreamErrorCause::Cancelled, "execution cancelled")
                        .await;
                }
                Err(StreamErrorCause::Timeout) => {
                    sender
                        .error(StreamErrorCause::Timeout, "execution timed out")
                        .await;
                }
                Err(StreamErrorCause::Execution) => {
                    sender
                        .error(StreamErrorCause::Execution, "failed to await subprocess")
                        .await;
                }
            }
        });

        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_catalog::ToolCatalog;
    use crucible_primitives::StreamEvent;

    fn backend() -> SubprocessBackend {
        SubprocessBackend::new(Arc::new(ToolCatalog::new()))
    }

    fn spec(argv: &[&str]) -> ExecutionSpec {
        ExecutionSpec::builder()
            .argv(argv.iter().copied())
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let backend = backend();
        let result = backend
            .execute(&spec(&["sh", "-c", "echo hello"]), CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.stdout_utf8().trim(), "hello");
        assert!(result.stderr().is_empty());
    }

    #[tokio::test]
    async fn reports_nonzero_exit() {
        let backend = backend();
        let result = backend
            .execute(&spec(&["sh", "-c", "exit 42"]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.exit_code(), 42);
    }

    #[tokio::test]
    async fn stdin_reaches_the_child() {
        let backend = backend();
        let spec = ExecutionSpec::builder()
            .argv(["cat"])
            .stdin(Bytes::from_static(b"ping"))
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        let result = backend.execute(&spec, CancellationToken::new()).await.unwrap();
        assert_eq!(result.stdout_utf8(), "ping");
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let backend = backend();
        let spec = ExecutionSpec::builder()
            .argv(["sleep", "30"])
            .timeout(Duration::from_millis(100))
            .build()
            .unwrap();

        let started = std::time::Instant::now();
        let err = backend
            .execute(&spec, CancellationToken::new())
            .await
            .expect_err("sleep should time out");
        assert!(matches!(err, BackendError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_beats_a_longer_timeout() {
        let backend = backend();
        let spec = ExecutionSpec::builder()
            .argv(["sleep", "30"])
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = backend
            .execute(&spec, cancel)
            .await
            .expect_err("cancelled invocation");
        assert!(matches!(err, BackendError::Cancelled));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let backend = backend();
        let err = backend
            .execute(
                &spec(&["definitely-not-a-real-binary-4f2a"]),
                CancellationToken::new(),
            )
            .await
            .expect_err("unknown binary");
        assert!(matches!(err, BackendError::Spawn { .. }));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let backend = backend();
        backend.stop().await.unwrap();
        backend.stop().await.unwrap();
    }

    #[tokio::test]
    async fn streaming_ends_with_exit_event() {
        let backend = backend();
        let source = backend
            .execute_stream(
                &spec(&["sh", "-c", "printf out; printf err >&2"]),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let events = source.drain().await;
        let last = events.last().expect("terminal event");
        assert_eq!(*last, StreamEvent::Exit { code: 0 });

        let stdout: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Output {
                    stream: OutputStream::Stdout,
                    bytes,
                } => Some(bytes.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(stdout, b"out");
    }

    #[tokio::test]
    async fn streaming_cancellation_emits_terminal_error() {
        let backend = backend();
        let cancel = CancellationToken::new();
        let mut source = backend
            .execute_stream(&spec(&["sleep", "30"]), cancel.clone())
            .await
            .unwrap();

        cancel.cancel();
        let mut terminal = None;
        while let Some(event) = source.next_event().await {
            if event.is_terminal() {
                terminal = Some(event);
                break;
            }
        }
        assert!(matches!(
            terminal,
            Some(StreamEvent::Error {
                cause: StreamErrorCause::Cancelled,
                ..
            })
        ));
    }
}
