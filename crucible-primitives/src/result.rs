//! Terminal execution results.

use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;

/// Terminal outcome of one non-streaming invocation.
///
/// Produced exactly once per invocation by the serving backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionResult {
    exit_code: i32,
    stdout: Bytes,
    stderr: Bytes,
    duration: Duration,
}

impl ExecutionResult {
    /// Creates a new result from captured sandbox output.
    #[must_use]
    pub fn new(
        exit_code: i32,
        stdout: impl Into<Bytes>,
        stderr: impl Into<Bytes>,
        duration: Duration,
    ) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration,
        }
    }

    /// Exit status reported by the sandbox.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Returns `true` when the invocation exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Captured standard output.
    #[must_use]
    pub fn stdout(&self) -> &Bytes {
        &self.stdout
    }

    /// Captured standard error.
    #[must_use]
    pub fn stderr(&self) -> &Bytes {
        &self.stderr
    }

    /// Elapsed wall time of the invocation.
    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    /// Returns stdout decoded as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn stdout_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Returns the invocation's output value for chaining.
    ///
    /// Stdout that parses as JSON is returned as-is; anything else becomes a
    /// trimmed JSON string.
    #[must_use]
    pub fn output_value(&self) -> Value {
        let text = self.stdout_utf8();
        let trimmed = text.trim();
        serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_stdout_becomes_structured_value() {
        let result = ExecutionResult::new(0, r#"{"ok":true}"#, "", Duration::from_millis(3));
        assert_eq!(result.output_value(), serde_json::json!({"ok": true}));
    }

    #[test]
    fn plain_stdout_becomes_string_value() {
        let result = ExecutionResult::new(0, "hello\n", "", Duration::from_millis(1));
        assert_eq!(result.output_value(), Value::String("hello".into()));
        assert!(result.success());
    }
}
