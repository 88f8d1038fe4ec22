//! Durable runtime limits seeding the engine's default budgets.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::EngineConfig;
use crate::error::{EngineError, EngineResult};

/// Name of the single limits record inside the store directory. A fixed
/// file name keeps the store structurally single-record.
const LIMITS_FILE: &str = "runtime-limits.json";

/// Persisted runtime limits, read back at startup to seed defaults.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RuntimeLimits {
    /// Default invocation timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum tool calls per engine lifetime.
    pub max_tool_calls: u64,
    /// Maximum steps per chain.
    pub max_chain_steps: u64,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl RuntimeLimits {
    /// Captures the supplied engine configuration as a persistable record.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            timeout_ms: saturating_millis(config.default_timeout),
            max_tool_calls: config.max_tool_calls,
            max_chain_steps: u64::try_from(config.max_chain_steps).unwrap_or(u64::MAX),
            updated_at: Utc::now(),
        }
    }

    /// Applies the stored limits over the built-in defaults.
    #[must_use]
    pub fn into_config(self) -> EngineConfig {
        EngineConfig {
            default_timeout: Duration::from_millis(self.timeout_ms),
            max_tool_calls: self.max_tool_calls,
            max_chain_steps: usize::try_from(self.max_chain_steps).unwrap_or(usize::MAX),
            ..EngineConfig::default()
        }
    }
}

/// Converts a duration to whole milliseconds, saturating instead of
/// wrapping.
fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Load/save contract for the single limits record.
///
/// Absence of a stored record is not an error, only a signal to use the
/// built-in defaults.
#[async_trait]
pub trait LimitsStore: Send + Sync {
    /// Loads the stored record, if one exists.
    ///
    /// # Errors
    ///
    /// Fails when a record exists but cannot be read or parsed.
    async fn load(&self) -> EngineResult<Option<RuntimeLimits>>;

    /// Saves the record, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Fails when the record cannot be written.
    async fn save(&self, limits: &RuntimeLimits) -> EngineResult<()>;
}

/// File-backed limits store holding at most one record at a fixed path.
#[derive(Clone, Debug)]
pub struct FileLimitsStore {
    path: PathBuf,
}

impl FileLimitsStore {
    /// Creates a store rooted at `dir`; the record lives at a fixed file
    /// name inside it.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(LIMITS_FILE),
        }
    }

    /// Path of the backing record file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LimitsStore for FileLimitsStore {
    async fn load(&self) -> EngineResult<Option<RuntimeLimits>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(EngineError::internal(format!(
                    "failed to read limits record: {source}"
                )));
            }
        };

        let limits = serde_json::from_slice(&raw).map_err(|source| {
            EngineError::internal(format!("failed to parse limits record: {source}"))
        })?;
        Ok(Some(limits))
    }

    async fn save(&self, limits: &RuntimeLimits) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|source| {
                EngineError::internal(format!("failed to create limits directory: {source}"))
            })?;
        }

        let raw = serde_json::to_vec_pretty(limits).map_err(|source| {
            EngineError::internal(format!("failed to encode limits record: {source}"))
        })?;
        tokio::fs::write(&self.path, raw).await.map_err(|source| {
            EngineError::internal(format!("failed to write limits record: {source}"))
        })?;
        debug!(path = %self.path.display(), "limits record saved");
        Ok(())
    }
}
