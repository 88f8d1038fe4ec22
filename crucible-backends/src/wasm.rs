//! In-process WebAssembly backend built on Wasmtime.
//!
//! Modules run under WASI preview1 with pipe-backed stdio, a linear-memory
//! cap enforced through the store limiter, and epoch interruption for
//! deadline and cancellation teardown. Compilation happens before any
//! sandbox resources are allocated, so malformed modules fail fast.

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use crucible_catalog::ToolLookup;
use crucible_primitives::{
    BackendKind, ExecutionResult, ExecutionSpec, OutputStream, StreamErrorCause, ToolId,
    WASM_PAGE_BYTES,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use wasi_common::I32Exit;
use wasi_common::WasiCtx;
use wasi_common::pipe::{ReadPipe, WritePipe};
use wasmtime_wasi::sync::WasiCtxBuilder;
use wasmtime::{
    Config, Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap,
};

use crate::contract::{Backend, Health, tools_for_kind};
use crate::error::{BackendError, BackendResult};
use crate::invocation::{Invocation, InvocationEvent};
use crate::stream::{EventSender, EventSource};

/// Configuration for the WebAssembly backend.
#[derive(Clone, Copy, Debug)]
pub struct WasmConfig {
    /// Linear-memory page cap applied when the invocation envelope carries
    /// no memory limit of its own.
    pub default_max_memory_pages: u32,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            // 64 MiB of linear memory.
            default_max_memory_pages: 1024,
        }
    }
}

/// Per-store state: the WASI context plus the resource limiter.
struct WasmState {
    wasi: WasiCtx,
    limits: StoreLimits,
}

/// Backend running specs as WASI preview1 modules inside the host process.
pub struct WasmBackend {
    name: String,
    config: WasmConfig,
    catalog: Arc<dyn ToolLookup>,
}

impl WasmBackend {
    /// Creates a WebAssembly backend over the supplied catalog.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Unavailable`] when an engine cannot be
    /// initialized with the sandbox configuration.
    pub fn new(config: WasmConfig, catalog: Arc<dyn ToolLookup>) -> BackendResult<Self> {
        // Verify the sandbox configuration up front; invocations build
        // their own engines.
        Self::sandbox()?;
        Ok(Self {
            name: "wasm".to_owned(),
            config,
            catalog,
        })
    }

    /// Builds the engine and linker for one invocation.
    ///
    /// Each invocation owns its engine: the epoch counter is engine-global,
    /// so a shared engine would let one invocation's deadline trap every
    /// other module running at the same time.
    fn sandbox() -> BackendResult<(Engine, Linker<WasmState>)> {
        let mut engine_config = Config::new();
        engine_config.epoch_interruption(true);
        let engine = Engine::new(&engine_config).map_err(|source| {
            BackendError::unavailable(
                BackendKind::Wasm,
                format!("failed to initialize engine: {source}"),
            )
        })?;

        let mut linker = Linker::new(&engine);
        wasmtime_wasi::add_to_linker(&mut linker, |state: &mut WasmState| &mut state.wasi)
            .map_err(|source| {
                BackendError::unavailable(
                    BackendKind::Wasm,
                    format!("failed to link WASI imports: {source}"),
                )
            })?;
        Ok((engine, linker))
    }

    fn compile(engine: &Engine, spec: &ExecutionSpec) -> BackendResult<Module> {
        if spec.module().is_empty() {
            return Err(BackendError::InvalidModule {
                reason: "invocation carries no module bytes".into(),
            });
        }
        Module::new(engine, spec.module()).map_err(|source| BackendError::InvalidModule {
            reason: source.to_string(),
        })
    }

    fn memory_limit(&self, spec: &ExecutionSpec) -> usize {
        let bytes = spec
            .envelope()
            .memory_bytes()
            .unwrap_or(u64::from(self.config.default_max_memory_pages) * WASM_PAGE_BYTES);
        usize::try_from(bytes).unwrap_or(usize::MAX)
    }

    fn wasi_args(spec: &ExecutionSpec) -> Vec<String> {
        if spec.argv().is_empty() {
            vec!["module".to_owned()]
        } else {
            spec.argv().to_vec()
        }
    }

    /// Spawns the interruption watcher: the first of caller cancellation or
    /// the deadline bumps the invocation's epoch, trapping the running
    /// module. `done` fires when the module finishes or the caller abandons
    /// the invocation; the bump there unwinds a worker whose caller is gone
    /// and is a no-op once the store has been dropped.
    fn spawn_watcher(
        engine: Engine,
        cancel: CancellationToken,
        timeout: Option<Duration>,
        cancelled: Arc<AtomicBool>,
        timed_out: Arc<AtomicBool>,
        done: CancellationToken,
    ) {
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = done.cancelled() => {
                    engine.increment_epoch();
                }
                () = cancel.cancelled() => {
                    cancelled.store(true, Ordering::SeqCst);
                    engine.increment_epoch();
                }
                () = Self::deadline(timeout) => {
                    timed_out.store(true, Ordering::SeqCst);
                    engine.increment_epoch();
                }
            }
        });
    }

    async fn deadline(timeout: Option<Duration>) {
        match timeout {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    }

    /// Runs the compiled module to completion on a blocking thread.
    ///
    /// Returns the module's exit code; flag state turns an epoch trap into
    /// the matching `Cancelled`/`Timeout` error.
    #[allow(clippy::too_many_arguments)]
    fn run_module(
        linker: &Linker<WasmState>,
        engine: &Engine,
        module: &Module,
        wasi: WasiCtx,
        memory_limit: usize,
        cancelled: &AtomicBool,
        timed_out: &AtomicBool,
        started: Instant,
    ) -> BackendResult<i32> {
        let limits = StoreLimitsBuilder::new()
            .memory_size(memory_limit)
            .trap_on_grow_failure(true)
            .build();
        let mut store = Store::new(engine, WasmState { wasi, limits });
        store.limiter(|state| &mut state.limits);
        store.set_epoch_deadline(1);

        let instance = linker
            .instantiate(&mut store, module)
            .map_err(|source| BackendError::execution(format!("instantiation failed: {source}")))?;
        let start = instance
            .get_typed_func::<(), ()>(&mut store, "_start")
            .map_err(|source| {
                BackendError::execution(format!("module has no _start entrypoint: {source}"))
            })?;

        match start.call(&mut store, ()) {
            Ok(()) => Ok(0),
            Err(error) => {
                if let Some(exit) = error.downcast_ref::<I32Exit>() {
                    return Ok(exit.0);
                }
                if error.downcast_ref::<Trap>() == Some(&Trap::Interrupt) {
                    if cancelled.load(Ordering::SeqCst) {
                        return Err(BackendError::Cancelled);
                    }
                    if timed_out.load(Ordering::SeqCst) {
                        return Err(BackendError::Timeout {
                            elapsed: started.elapsed(),
                        });
                    }
                }
                Err(BackendError::execution(format!("module trapped: {error}")))
            }
        }
    }

    fn drain_pipe(pipe: WritePipe<Cursor<Vec<u8>>>) -> Vec<u8> {
        pipe.try_into_inner()
            .map(Cursor::into_inner)
            .unwrap_or_default()
    }
}

#[async_trait]
impl Backend for WasmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Wasm
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn start(&self) -> BackendResult<()> {
        // The sandbox configuration was verified in the constructor.
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
        let (engine, linker) = Self::sandbox()?;
        let module = Self::compile(&engine, spec)?;

        let stdout_pipe = WritePipe::new_in_memory();
        let stderr_pipe = WritePipe::new_in_memory();
        let mut builder = WasiCtxBuilder::new();
        builder
            .args(&Self::wasi_args(spec))
            .map_err(|source| BackendError::execution(format!("invalid argv: {source}")))?
            .envs(spec.env())
            .map_err(|source| BackendError::execution(format!("invalid env: {source}")))?
            .stdin(Box::new(ReadPipe::from(spec.stdin().to_vec())))
            .stdout(Box::new(stdout_pipe.clone()))
            .stderr(Box::new(stderr_pipe.clone()));
        let wasi = builder.build();

        let cancelled = Arc::new(AtomicBool::new(false));
        let timed_out = Arc::new(AtomicBool::new(false));
        let done = CancellationToken::new();
        let _done_guard = done.clone().drop_guard();
        Self::spawn_watcher(
            engine.clone(),
            cancel,
            spec.timeout(),
            Arc::clone(&cancelled),
            Arc::clone(&timed_out),
            done,
        );
        invocation.transition(InvocationEvent::Launch)?;

        let memory_limit = self.memory_limit(spec);
        let started = Instant::now();
        let outcome = tokio::task::spawn_blocking(move || {
            Self::run_module(
                &linker,
                &engine,
                &module,
                wasi,
                memory_limit,
                &cancelled,
                &timed_out,
                started,
            )
        })
        .await
        .map_err(|_| BackendError::execution("sandbox worker panicked"))?;

        let code = match outcome {
            Ok(code) => code,
            Err(BackendError::Cancelled) => {
                invocation.transition(InvocationEvent::Cancel)?;
                return Err(BackendError::Cancelled);
            }
            Err(BackendError::Timeout { .. }) => {
                invocation.transition(InvocationEvent::Expire)?;
                return Err(BackendError::Timeout {
                    elapsed: invocation.elapsed(),
                });
            }
            Err(error) => {
                invocation.transition(InvocationEvent::Fail)?;
                return Err(error);
            }
        };
        invocation.transition(InvocationEvent::Succeed)?;
        debug!(
            backend = %self.kind(),
            exit_code = code,
            elapsed_ms = invocation.elapsed().as_millis() as u64,
            "wasm invocation complete"
        );

        Ok(ExecutionResult::new(
            code,
            Self::drain_pipe(stdout_pipe),
            Self::drain_pipe(stderr_pipe),
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
        let (engine, linker) = Self::sandbox()?;
        let module = Self::compile(&engine, spec)?;

        let guard = cancel.child_token();
        let (source, sender) = EventSource::channel(guard);

        let stdout_pipe = WritePipe::new(ChannelWriter {
            sender: sender.clone(),
            stream: OutputStream::Stdout,
        });
        let stderr_pipe = WritePipe::new(ChannelWriter {
            sender: sender.clone(),
            stream: OutputStream::Stderr,
        });
        let mut builder = WasiCtxBuilder::new();
        builder
            .args(&Self::wasi_args(spec))
            .map_err(|source| BackendError::execution(format!("invalid argv: {source}")))?
            .envs(spec.env())
            .map_err(|source| BackendError::execution(format!("invalid env: {source}")))?
            .stdin(Box::new(ReadPipe::from(spec.stdin().to_vec())))
            .stdout(Box::new(stdout_pipe))
            .stderr(Box::new(stderr_pipe));
        let wasi = builder.build();

        let cancelled = Arc::new(AtomicBool::new(false));
        let timed_out = Arc::new(AtomicBool::new(false));
        let done = CancellationToken::new();
        Self::spawn_watcher(
            engine.clone(),
            sender.guard().clone(),
            spec.timeout(),
            Arc::clone(&cancelled),
            Arc::clone(&timed_out),
            done.clone(),
        );

        let memory_limit = self.memory_limit(spec);
        let started = Instant::now();
        tokio::spawn(async move {
            let _done_guard = done.drop_guard();
            let worker_cancelled = Arc::clone(&cancelled);
            let worker_timed_out = Arc::clone(&timed_out);
            let outcome = tokio::task::spawn_blocking(move || {
                Self::run_module(
                    &linker,
                    &engine,
                    &module,
                    wasi,
                    memory_limit,
                    &worker_cancelled,
                    &worker_timed_out,
                    started,
                )
            })
            .await
            .map_err(|_| BackendError::execution("sandbox worker panicked"));

            match outcome {
                Ok(Ok(code)) => sender.exit(code).await,
                Ok(Err(BackendError::Cancelled)) => {
                    sender
                        .error(StreamErrorCause::Cancelled, "execution cancelled")
                        .await;
                }
                Ok(Err(BackendError::Timeout { .. })) => {
                    sender
                        .error(StreamErrorCause::Timeout, "execution timed out")
                        .await;
                }
                Ok(Err(error)) | Err(error) => {
                    sender
                        .error(StreamErrorCause::Execution, error.to_string())
                        .await;
                }
            }
        });

        Ok(source)
    }
}

/// `Write` adapter forwarding sandbox output as stream events.
///
/// A send failure means the consumer went away; reporting it as a broken
/// pipe makes the module's own writes fail from then on.
struct ChannelWriter {
    sender: EventSender,
    stream: OutputStream,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self
            .sender
            .output_blocking(self.stream, Bytes::copy_from_slice(buf))
        {
            Ok(buf.len())
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stream consumer dropped",
            ))
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_catalog::ToolCatalog;
    use crucible_primitives::{ResourceEnvelope, StreamEvent};

    const HELLO: &str = r#"
        (module
            (import "wasi_snapshot_preview1" "fd_write"
                (func $fd_write (param i32 i32 i32 i32) (result i32)))
            (memory (export "memory") 1)
            (data (i32.const 8) "hello\n")
            (func (export "_start")
                (i32.store (i32.const 0) (i32.const 8))
                (i32.store (i32.const 4) (i32.const 6))
                (call $fd_write
                    (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 20))
                drop))
    "#;

    const EXIT_42: &str = r#"
        (module
            (import "wasi_snapshot_preview1" "proc_exit"
                (func $proc_exit (param i32)))
            (memory (export "memory") 1)
            (func (export "_start")
                (call $proc_exit (i32.const 42))))
    "#;

    const SPIN: &str = r#"
        (module
            (memory (export "memory") 1)
            (func (export "_start")
                (loop $l (br $l))))
    "#;

    const GROW: &str = r#"
        (module
            (memory (export "memory") 1)
            (func (export "_start")
                (if (i32.eq (memory.grow (i32.const 64)) (i32.const -1))
                    (then unreachable))))
    "#;

    fn backend() -> WasmBackend {
        WasmBackend::new(WasmConfig::default(), Arc::new(ToolCatalog::new())).unwrap()
    }

    fn spec(wat: &str, timeout: Duration) -> ExecutionSpec {
        ExecutionSpec::builder()
            .module(Bytes::copy_from_slice(wat.as_bytes()))
            .timeout(timeout)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn runs_a_module_and_captures_stdout() {
        let backend = backend();
        let result = backend
            .execute(
                &spec(HELLO, Duration::from_secs(10)),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.stdout_utf8(), "hello\n");
    }

    #[tokio::test]
    async fn proc_exit_surfaces_as_exit_code() {
        let backend = backend();
        let result = backend
            .execute(
                &spec(EXIT_42, Duration::from_secs(10)),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code(), 42);
    }

    #[tokio::test]
    async fn infinite_loop_times_out() {
        let backend = backend();
        let started = Instant::now();
        let err = backend
            .execute(
                &spec(SPIN, Duration::from_millis(200)),
                CancellationToken::new(),
            )
            .await
            .expect_err("spin should time out");
        assert!(matches!(err, BackendError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_beats_a_longer_timeout() {
        let backend = backend();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = backend
            .execute(&spec(SPIN, Duration::from_secs(10)), cancel)
            .await
            .expect_err("cancelled invocation");
        assert!(matches!(err, BackendError::Cancelled));
    }

    #[tokio::test]
    async fn one_invocations_deadline_leaves_others_running() {
        let backend = Arc::new(backend());
        let cancel = CancellationToken::new();

        let slow_backend = Arc::clone(&backend);
        let slow_cancel = cancel.clone();
        let slow = tokio::spawn(async move {
            slow_backend
                .execute(&spec(SPIN, Duration::from_secs(30)), slow_cancel)
                .await
        });

        let fast = backend
            .execute(
                &spec(SPIN, Duration::from_millis(100)),
                CancellationToken::new(),
            )
            .await
            .expect_err("short deadline");
        assert!(matches!(fast, BackendError::Timeout { .. }));

        // The slow invocation must survive the fast one's deadline and
        // terminate only through its own cancellation.
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let err = slow.await.unwrap().expect_err("cancelled invocation");
        assert!(matches!(err, BackendError::Cancelled));
    }

    #[tokio::test]
    async fn abandoned_invocation_unwinds_its_worker() {
        let backend = backend();
        let outcome = tokio::time::timeout(
            Duration::from_millis(100),
            backend.execute(&spec(SPIN, Duration::from_secs(30)), CancellationToken::new()),
        )
        .await;
        assert!(outcome.is_err());
        // Runtime shutdown waits for blocking workers; the test only
        // finishes if dropping the invocation interrupted the module.
    }

    #[tokio::test]
    async fn malformed_module_is_rejected_before_execution() {
        let backend = backend();
        let spec = ExecutionSpec::builder()
            .module(Bytes::from_static(b"\x00asm not a module"))
            .build()
            .unwrap();

        let err = backend
            .execute(&spec, CancellationToken::new())
            .await
            .expect_err("malformed module");
        assert!(matches!(err, BackendError::InvalidModule { .. }));
    }

    #[tokio::test]
    async fn growth_beyond_the_envelope_fails() {
        let backend = backend();
        let spec = ExecutionSpec::builder()
            .module(Bytes::copy_from_slice(GROW.as_bytes()))
            .envelope(ResourceEnvelope {
                max_memory_pages: Some(2),
                ..ResourceEnvelope::default()
            })
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        let err = backend
            .execute(&spec, CancellationToken::new())
            .await
            .expect_err("growth past the cap");
        assert!(matches!(err, BackendError::Execution { .. }));
    }

    #[tokio::test]
    async fn streaming_forwards_output_then_exits() {
        let backend = backend();
        let source = backend
            .execute_stream(
                &spec(HELLO, Duration::from_secs(10)),
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
        assert_eq!(stdout, b"hello\n");
    }

    #[tokio::test]
    async fn streaming_timeout_emits_terminal_error() {
        let backend = backend();
        let mut source = backend
            .execute_stream(
                &spec(SPIN, Duration::from_millis(200)),
                CancellationToken::new(),
            )
            .await
            .unwrap();

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
                cause: StreamErrorCause::Timeout,
                ..
            })
        ));
    }
}
