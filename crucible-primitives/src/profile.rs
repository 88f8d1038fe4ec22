//! Security profiles and backend kinds.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Named trust tier determining which sandbox backend handles execution.
///
/// Exactly one backend is bound per profile at any time. The active profile
/// is process-wide configuration chosen at startup and never renegotiated
/// during a run.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityProfile {
    /// Trusted local development. Bound to the subprocess backend, which
    /// grants the invoked code unrestricted host access.
    Dev,
    /// Default tier for untrusted code. Bound to an isolating backend
    /// (container or WebAssembly) when one is available.
    #[default]
    Standard,
}

impl SecurityProfile {
    /// Returns the stable configuration name of the profile.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Standard => "standard",
        }
    }
}

impl Display for SecurityProfile {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityProfile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" => Ok(Self::Dev),
            "standard" => Ok(Self::Standard),
            other => Err(Error::InvalidSpec {
                reason: format!("unknown security profile `{other}`"),
            }),
        }
    }
}

/// Kind of sandbox backing an execution.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Unconfined local OS process.
    Subprocess,
    /// Ephemeral container managed by a container daemon.
    Container,
    /// Memory-sandboxed WebAssembly module instance.
    Wasm,
}

impl BackendKind {
    /// Returns the stable name of the backend kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subprocess => "subprocess",
            Self::Container => "container",
            Self::Wasm => "wasm",
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subprocess" => Ok(Self::Subprocess),
            "container" => Ok(Self::Container),
            "wasm" => Ok(Self::Wasm),
            other => Err(Error::InvalidSpec {
                reason: format!("unknown backend kind `{other}`"),
            }),
        }
    }
}
