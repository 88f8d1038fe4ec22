//! Startup configuration for the Crucible runtime.
//!
//! Configuration is read once at startup from a TOML file; a missing file
//! is not an error and yields the built-in defaults. The loaded
//! [`RuntimeConfig`] converts into the selector and engine configurations
//! and [`bootstrap`] wires the whole runtime together.

#![warn(missing_docs, clippy::pedantic)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crucible_backends::{ContainerConfig, RuntimeSelector, SelectorConfig, WasmConfig};
use crucible_catalog::ToolLookup;
use crucible_engine::{EngineConfig, ExecutionEngine, FileLimitsStore, LimitsStore};
use crucible_primitives::{BackendKind, ResourceEnvelope, SecurityProfile};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

/// Result alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file exists but could not be read.
    #[error("failed to read config at {path}: {source}")]
    Read {
        /// Path of the offending file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be parsed as TOML.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        /// Path of the offending file.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level runtime configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Active security profile.
    pub profile: SecurityProfile,
    /// Backend enables and settings.
    pub backends: BackendsConfig,
    /// Default execution budgets.
    pub budgets: BudgetsConfig,
    /// Persisted-limits store settings.
    pub limits: LimitsConfig,
}

/// Backend selection section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendsConfig {
    /// Isolated backends tried in order under the standard profile.
    pub preference: Vec<BackendKind>,
    /// Container backend settings.
    pub container: ContainerSection,
    /// WebAssembly backend settings.
    pub wasm: WasmSection,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            preference: vec![BackendKind::Container, BackendKind::Wasm],
            container: ContainerSection::default(),
            wasm: WasmSection::default(),
        }
    }
}

/// Container backend section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerSection {
    /// Whether the container backend may be bound.
    pub enabled: bool,
    /// Image invocation containers are created from.
    pub image: String,
}

impl Default for ContainerSection {
    fn default() -> Self {
        let defaults = ContainerConfig::default();
        Self {
            enabled: true,
            image: defaults.image,
        }
    }
}

/// WebAssembly backend section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WasmSection {
    /// Whether the WebAssembly backend may be bound.
    pub enabled: bool,
    /// Default linear-memory page cap.
    pub max_memory_pages: u32,
}

impl Default for WasmSection {
    fn default() -> Self {
        let defaults = WasmConfig::default();
        Self {
            enabled: true,
            max_memory_pages: defaults.default_max_memory_pages,
        }
    }
}

/// Default execution budgets section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BudgetsConfig {
    /// Default invocation timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum tool calls per engine lifetime.
    pub max_tool_calls: u64,
    /// Maximum steps per chain.
    pub max_chain_steps: usize,
    /// Default linear-memory page cap applied to specs without one.
    pub max_memory_pages: Option<u32>,
}

impl Default for BudgetsConfig {
    fn default() -> Self {
        let defaults = EngineConfig::default();
        Self {
            timeout_ms: u64::try_from(defaults.default_timeout.as_millis()).unwrap_or(u64::MAX),
            max_tool_calls: defaults.max_tool_calls,
            max_chain_steps: defaults.max_chain_steps,
            max_memory_pages: None,
        }
    }
}

/// Persisted-limits section.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// Directory holding the single limits record; `None` disables the
    /// store.
    pub dir: Option<PathBuf>,
}

impl RuntimeConfig {
    /// Loads configuration from a TOML file. A missing file yields the
    /// defaults.
    ///
    /// # Errors
    ///
    /// Fails when the file exists but cannot be read or parsed.
    pub async fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_owned(),
                    source,
                });
            }
        };

        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Converts the backend section into the selector configuration.
    #[must_use]
    pub fn selector_config(&self) -> SelectorConfig {
        SelectorConfig {
            preference: self.backends.preference.clone(),
            container_enabled: self.backends.container.enabled,
            container: ContainerConfig {
                image: self.backends.container.image.clone(),
            },
            wasm_enabled: self.backends.wasm.enabled,
            wasm: WasmConfig {
                default_max_memory_pages: self.backends.wasm.max_memory_pages,
            },
        }
    }

    /// Converts the budget section into the engine configuration.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            default_timeout: Duration::from_millis(self.budgets.timeout_ms),
            max_tool_calls: self.budgets.max_tool_calls,
            max_chain_steps: self.budgets.max_chain_steps,
            default_envelope: ResourceEnvelope {
                max_memory_pages: self.budgets.max_memory_pages,
                ..ResourceEnvelope::default()
            },
        }
    }
}

/// Binds the selector and builds the engine from loaded configuration.
///
/// When a limits store directory is configured, a stored limits record
/// overrides the configured budgets; store failures are downgraded to
/// warnings since persisted limits only seed defaults.
pub async fn bootstrap(
    config: &RuntimeConfig,
    catalog: Arc<dyn ToolLookup>,
) -> (Arc<RuntimeSelector>, ExecutionEngine) {
    let mut engine_config = config.engine_config();
    if let Some(dir) = &config.limits.dir {
        let store = FileLimitsStore::new(dir);
        match store.load().await {
            Ok(Some(limits)) => {
                info!(path = %store.path().display(), "applying stored runtime limits");
                engine_config = EngineConfig {
                    default_envelope: engine_config.default_envelope,
                    ..limits.into_config()
                };
            }
            Ok(None) => {}
            Err(error) => {
                warn!(error = %error, "ignoring unreadable limits record");
            }
        }
    }

    let selector = Arc::new(
        RuntimeSelector::bind(
            config.profile,
            config.selector_config(),
            Arc::clone(&catalog),
        )
        .await,
    );
    let engine = ExecutionEngine::new(Arc::clone(&selector), catalog, engine_config);
    (selector, engine)
}

/// Initializes process-wide tracing from the `CRUCIBLE_LOG` environment
/// variable, defaulting to `info`. Safe to call more than once; later
/// calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("CRUCIBLE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_catalog::ToolCatalog;
    use uuid::Uuid;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join(format!("crucible-config-{}.toml", Uuid::new_v4()));
        let config = RuntimeConfig::load(&path).await.unwrap();
        assert_eq!(config.profile, SecurityProfile::Standard);
        assert!(config.backends.container.enabled);
        assert_eq!(
            config.backends.preference,
            vec![BackendKind::Container, BackendKind::Wasm]
        );
    }

    #[tokio::test]
    async fn partial_file_fills_remaining_defaults() {
        let path = std::env::temp_dir().join(format!("crucible-config-{}.toml", Uuid::new_v4()));
        tokio::fs::write(
            &path,
            "profile = \"dev\"\n\n[budgets]\ntimeout_ms = 5000\n",
        )
        .await
        .unwrap();

        let config = RuntimeConfig::load(&path).await.unwrap();
        assert_eq!(config.profile, SecurityProfile::Dev);
        assert_eq!(config.budgets.timeout_ms, 5000);
        assert_eq!(config.budgets.max_tool_calls, 64);
        assert!(config.backends.wasm.enabled);

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_keys_are_rejected() {
        let path = std::env::temp_dir().join(format!("crucible-config-{}.toml", Uuid::new_v4()));
        tokio::fs::write(&path, "not_a_key = true\n").await.unwrap();

        let err = RuntimeConfig::load(&path).await.expect_err("unknown key");
        assert!(matches!(err, ConfigError::Parse { .. }));

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[test]
    fn engine_config_carries_budgets() {
        let config = RuntimeConfig {
            budgets: BudgetsConfig {
                timeout_ms: 1_000,
                max_tool_calls: 5,
                max_chain_steps: 2,
                max_memory_pages: Some(8),
            },
            ..RuntimeConfig::default()
        };

        let engine = config.engine_config();
        assert_eq!(engine.default_timeout, Duration::from_secs(1));
        assert_eq!(engine.max_tool_calls, 5);
        assert_eq!(engine.max_chain_steps, 2);
        assert_eq!(engine.default_envelope.max_memory_pages, Some(8));
    }

    #[tokio::test]
    async fn bootstrap_binds_per_profile() {
        let config = RuntimeConfig {
            profile: SecurityProfile::Dev,
            ..RuntimeConfig::default()
        };
        let catalog: Arc<dyn ToolLookup> = Arc::new(ToolCatalog::new());

        let (selector, engine) = bootstrap(&config, catalog).await;
        assert_eq!(selector.bound_kind(), Some(BackendKind::Subprocess));
        assert_eq!(engine.profile(), SecurityProfile::Dev);
        selector.shutdown().await.unwrap();
    }
}
