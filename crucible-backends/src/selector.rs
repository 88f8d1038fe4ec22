//! Security-profile-driven backend selection.
//!
//! The selector binds exactly one backend at startup and keeps it for the
//! lifetime of the runtime. The development profile always binds the
//! unconfined subprocess backend; the standard profile walks the configured
//! preference order and binds the first isolated backend that starts and
//! reports healthy.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crucible_catalog::ToolLookup;
use crucible_primitives::{BackendKind, SecurityProfile};
use tracing::{info, warn};

use crate::container::{ContainerBackend, ContainerConfig};
use crate::contract::Backend;
use crate::error::BackendResult;
use crate::subprocess::SubprocessBackend;
use crate::wasm::{WasmBackend, WasmConfig};

/// Configuration for backend selection.
#[derive(Clone, Debug)]
pub struct SelectorConfig {
    /// Isolated backends tried in order under the standard profile.
    pub preference: Vec<BackendKind>,
    /// Whether the container backend may be bound.
    pub container_enabled: bool,
    /// Container backend settings.
    pub container: ContainerConfig,
    /// Whether the WebAssembly backend may be bound.
    pub wasm_enabled: bool,
    /// WebAssembly backend settings.
    pub wasm: WasmConfig,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            preference: vec![BackendKind::Container, BackendKind::Wasm],
            container_enabled: true,
            container: ContainerConfig::default(),
            wasm_enabled: true,
            wasm: WasmConfig::default(),
        }
    }
}

/// Binds one backend per runtime according to the security profile.
pub struct RuntimeSelector {
    profile: SecurityProfile,
    bound: Option<Arc<dyn Backend>>,
    stopped: AtomicBool,
}

impl RuntimeSelector {
    /// Builds and binds a backend for the given profile.
    ///
    /// Under [`SecurityProfile::Dev`] the subprocess backend is bound
    /// unconditionally. Under [`SecurityProfile::Standard`] the preference
    /// order is walked; candidates that are disabled, fail to start, or
    /// report unhealthy are skipped with a warning. Ending up with no bound
    /// backend is not an error here: invocations then fail with a
    /// no-backends error at call time.
    pub async fn bind(
        profile: SecurityProfile,
        config: SelectorConfig,
        catalog: Arc<dyn ToolLookup>,
    ) -> Self {
        let bound = match profile {
            SecurityProfile::Dev => {
                let backend: Arc<dyn Backend> =
                    Arc::new(SubprocessBackend::new(Arc::clone(&catalog)));
                info!(profile = %profile, backend = %backend.kind(), "bound backend");
                Some(backend)
            }
            SecurityProfile::Standard => {
                Self::bind_standard(&config, &catalog).await
            }
        };

        if bound.is_none() {
            warn!(profile = %profile, "no sandbox backend could be bound");
        }
        Self {
            profile,
            bound,
            stopped: AtomicBool::new(false),
        }
    }

    async fn bind_standard(
        config: &SelectorConfig,
        catalog: &Arc<dyn ToolLookup>,
    ) -> Option<Arc<dyn Backend>> {
        for kind in &config.preference {
            let candidate: Arc<dyn Backend> = match kind {
                BackendKind::Subprocess => {
                    // The unconfined backend is never a standard-profile
                    // candidate, regardless of preference order.
                    warn!("subprocess backend ignored under the standard profile");
                    continue;
                }
                BackendKind::Container => {
                    if !config.container_enabled {
                        continue;
                    }
                    Arc::new(ContainerBackend::new(
                        config.container.clone(),
                        Arc::clone(catalog),
                    ))
                }
                BackendKind::Wasm => {
                    if !config.wasm_enabled {
                        continue;
                    }
                    match WasmBackend::new(config.wasm, Arc::clone(catalog)) {
                        Ok(backend) => Arc::new(backend),
                        Err(error) => {
                            warn!(backend = %kind, error = %error, "backend construction failed");
                            continue;
                        }
                    }
                }
            };

            if let Err(error) = candidate.start().await {
                warn!(backend = %kind, error = %error, "backend failed to start");
                continue;
            }
            let health = candidate.health().await;
            if !health.is_healthy() {
                warn!(backend = %kind, health = ?health, "backend unhealthy at startup");
                let _ = candidate.stop().await;
                continue;
            }

            info!(profile = %SecurityProfile::Standard, backend = %kind, "bound backend");
            return Some(candidate);
        }
        None
    }

    /// Profile this selector was bound under.
    #[must_use]
    pub const fn profile(&self) -> SecurityProfile {
        self.profile
    }

    /// The bound backend, if any.
    #[must_use]
    pub fn backend(&self) -> Option<Arc<dyn Backend>> {
        self.bound.as_ref().map(Arc::clone)
    }

    /// Kind of the bound backend, if any.
    #[must_use]
    pub fn bound_kind(&self) -> Option<BackendKind> {
        self.bound.as_ref().map(|backend| backend.kind())
    }

    /// Stops the bound backend. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Propagates the backend's teardown failure.
    pub async fn shutdown(&self) -> BackendResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(backend) = &self.bound {
            backend.stop().await?;
        }
        Ok(())
    }
}
