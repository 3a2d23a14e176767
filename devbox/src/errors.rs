//! Error types for devbox.
//!
//! Install-time code propagates [`DevboxError`] and aborts on the first
//! failure. Runtime bring-up never raises: it collects [`RuntimeIssue`]s
//! carrying a remediation hint for the operator.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for devbox operations.
#[derive(Debug, Error)]
pub enum DevboxError {
    /// A pipeline definition was rejected.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A stage action reported failure.
    #[error("stage '{stage}' failed: {message}")]
    StageFailed {
        /// The failing stage.
        stage: String,
        /// What went wrong.
        message: String,
    },

    /// A download failed.
    #[error("{0}")]
    Fetch(#[from] FetchError),

    /// An archive could not be extracted.
    #[error("{0}")]
    Extract(#[from] ExtractError),

    /// An external command could not be run.
    #[error("{0}")]
    Process(#[from] ProcessError),

    /// Configuration could not be loaded or is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A marker id is not usable as a file name.
    #[error("invalid marker id '{0}'")]
    InvalidMarkerId(String),

    /// Something tried to delete identity or credential state.
    #[error("refusing to delete durable state at {}", .0.display())]
    DurableStateProtected(PathBuf),

    /// Execution was cancelled.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DevboxError {
    /// Creates a stage failure.
    #[must_use]
    pub fn stage_failed(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StageFailed {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Returns the failing stage name, if this error is a stage failure.
    #[must_use]
    pub fn failed_stage(&self) -> Option<&str> {
        match self {
            Self::StageFailed { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

/// Convenience alias.
pub type Result<T, E = DevboxError> = std::result::Result<T, E>;

/// Diagnostic metadata attached to an error or runtime issue.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (e.g., "NETID-READINESS-TIMEOUT").
    pub code: String,
    /// Short summary of the problem.
    pub summary: String,
    /// Concrete action the operator can take.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// A fail-soft problem observed during bring-up.
///
/// Issues are reported, never raised. The container keeps starting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeIssue {
    /// The service the issue belongs to.
    pub service: String,
    /// Diagnostics and remediation.
    pub info: ErrorInfo,
}

impl RuntimeIssue {
    /// Creates a runtime issue using the default remediation for `code`.
    #[must_use]
    pub fn new(service: impl Into<String>, code: &str, summary: impl Into<String>) -> Self {
        let mut info = ErrorInfo::new(code, summary);
        if let Some(hint) = Remediations::get(code) {
            info = info.with_fix_hint(hint);
        }
        Self {
            service: service.into(),
            info,
        }
    }

    /// Adds context to the issue.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.info = self.info.with_context_entry(key, value);
        self
    }

    /// Renders the issue as an operator-facing line.
    #[must_use]
    pub fn render(&self) -> String {
        match &self.info.fix_hint {
            Some(hint) => format!(
                "[{}] {}: {} -> {}",
                self.service, self.info.code, self.info.summary, hint
            ),
            None => format!("[{}] {}: {}", self.service, self.info.code, self.info.summary),
        }
    }
}

impl std::fmt::Display for RuntimeIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// Error raised when a pipeline definition is invalid.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }
}

/// Errors raised by the resilient fetcher.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// No strategy has its tool installed.
    #[error("no download tool available for {uri} (tried: {})", tried.join(", "))]
    NoStrategyAvailable {
        /// The requested URI.
        uri: String,
        /// Strategies that were considered.
        tried: Vec<String>,
    },

    /// The selected strategy reported failure.
    #[error("download of {uri} via {strategy} failed: {reason}")]
    StrategyFailed {
        /// The requested URI.
        uri: String,
        /// The strategy that failed.
        strategy: String,
        /// Failure details.
        reason: String,
    },

    /// The tool reported success but no usable file exists.
    #[error("download of {uri} via {strategy} left no file at {}", destination.display())]
    MissingOutput {
        /// The requested URI.
        uri: String,
        /// The strategy that ran.
        strategy: String,
        /// Where the file should be.
        destination: PathBuf,
    },

    /// The destination could not be prepared or read.
    #[error("cannot use download destination {}: {reason}", path.display())]
    Destination {
        /// The destination path.
        path: PathBuf,
        /// Failure details.
        reason: String,
    },

    /// The downloaded file does not match the expected digest.
    #[error("checksum mismatch for {uri}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The requested URI.
        uri: String,
        /// Expected sha256.
        expected: String,
        /// Actual sha256.
        actual: String,
    },
}

/// Errors raised while extracting archives.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The archive suffix is not recognized. This is a configuration error.
    #[error("unsupported archive type: {}", .0.display())]
    UnsupportedArchive(PathBuf),

    /// Extraction failed.
    #[error("failed to extract {}: {reason}", path.display())]
    Failed {
        /// The archive path.
        path: PathBuf,
        /// Failure details.
        reason: String,
    },
}

/// Errors raised when running external commands.
#[derive(Debug, Clone, Error)]
pub enum ProcessError {
    /// The program could not be started.
    #[error("failed to start {program}: {reason}")]
    Spawn {
        /// The program name.
        program: String,
        /// Failure details.
        reason: String,
    },

    /// The program exited unsuccessfully.
    #[error("{program} exited with status {code:?}: {stderr}")]
    Exit {
        /// The program name.
        program: String,
        /// Exit code, if the process was not killed by a signal.
        code: Option<i32>,
        /// Captured standard error (trimmed).
        stderr: String,
    },

    /// The program did not finish in time.
    #[error("{program} timed out after {seconds}s")]
    Timeout {
        /// The program name.
        program: String,
        /// Timeout in seconds.
        seconds: u64,
    },
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        /// The config path.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// The file is not valid TOML for the config schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is invalid.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Default remediation hints for runtime issue codes.
pub struct Remediations;

impl Remediations {
    /// Gets the remediation for a given issue code.
    #[must_use]
    pub fn get(code: &str) -> Option<&'static str> {
        match code {
            "NETID-DAEMON-START" => Some(
                "Check that the network daemon binary is installed and that /dev/net/tun \
                 is available, then restart the container.",
            ),
            "NETID-READINESS-TIMEOUT" => Some(
                "The daemon did not become ready. Restart the container; repeated timeouts \
                 trigger a cleanup of transient daemon state.",
            ),
            "NETID-CLEAN-RESTART" => Some(
                "Transient daemon state was cleared and identity preserved. Restart the \
                 container to bring the daemon up cleanly.",
            ),
            "NETID-AUTH" => Some(
                "Provide a valid auth key via the credential environment variable or the \
                 persisted auth key file. The background watcher keeps retrying.",
            ),
            "NETID-NO-CREDENTIAL" => Some(
                "The node needs authentication. Set the credential environment variable or \
                 write a single-line key to the auth key file.",
            ),
            "NETID-UNKNOWN-STATE" => Some(
                "Backend state could not be determined. Inspect the daemon log; no \
                 corrective action was taken.",
            ),
            "NETID-SECONDARY-ACCESS" => Some(
                "Connectivity is up but enabling secondary access failed. Re-run the \
                 secondary access command manually.",
            ),
            "SSH-HOSTKEY" => Some(
                "Host keys could not be generated. Check that ssh-keygen is installed and \
                 the key directory is writable.",
            ),
            "SSH-CONFIG-INVALID" => Some(
                "sshd rejected the rendered configuration after one repair attempt. Run \
                 `sshd -t -f <config>` to see the exact problem.",
            ),
            "SSH-START" => Some("sshd failed to start. Check the port is free and sshd is installed."),
            "PERMISSIONS" => Some(
                "Ownership could not be repaired on part of the volume. Network-backed \
                 volumes may reject chown; fix ownership from the host if needed.",
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_info_creation() {
        let info = ErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("stage", "my_stage");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.summary, "Test error");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("stage"), Some(&"my_stage".to_string()));
    }

    #[test]
    fn test_stage_failed_names_stage() {
        let err = DevboxError::stage_failed("palabos", "make exited with 2");
        assert_eq!(err.failed_stage(), Some("palabos"));
        assert_eq!(err.to_string(), "stage 'palabos' failed: make exited with 2");
    }

    #[test]
    fn test_runtime_issue_carries_remediation() {
        let issue = RuntimeIssue::new("netid", "NETID-NO-CREDENTIAL", "node needs login");
        assert!(issue.info.fix_hint.is_some());
        assert!(issue.render().contains("->"));
    }

    #[test]
    fn test_runtime_issue_without_known_code() {
        let issue = RuntimeIssue::new("netid", "SOMETHING-ELSE", "odd");
        assert!(issue.info.fix_hint.is_none());
        assert_eq!(issue.render(), "[netid] SOMETHING-ELSE: odd");
    }

    #[test]
    fn test_fetch_error_lists_tried_strategies() {
        let err = FetchError::NoStrategyAvailable {
            uri: "https://example.invalid/a.tgz".to_string(),
            tried: vec!["aria2c".to_string(), "curl".to_string()],
        };
        assert!(err.to_string().contains("aria2c, curl"));
    }
}
