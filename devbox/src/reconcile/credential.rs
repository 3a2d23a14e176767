//! Credential lookup for the network identity service.

use crate::config::NetworkConfig;
use crate::errors::ConfigError;
use crate::layout::PersistentLayout;
use regex::Regex;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, warn};

/// An auth key. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    #[cfg(test)]
    pub(crate) fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw key.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Where a credential came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialOrigin {
    /// The named environment variable.
    Environment(String),
    /// A persisted single-line file.
    File(PathBuf),
}

/// Environment variable first, then the persisted file.
#[derive(Debug, Clone)]
pub struct CredentialSource {
    env_var: String,
    file: PathBuf,
    pattern: Regex,
}

impl CredentialSource {
    /// Creates a source.
    pub fn new(
        env_var: impl Into<String>,
        file: impl Into<PathBuf>,
        pattern: &str,
    ) -> Result<Self, ConfigError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| ConfigError::Invalid(format!("credential pattern: {e}")))?;
        Ok(Self {
            env_var: env_var.into(),
            file: file.into(),
            pattern,
        })
    }

    /// Creates the source described by the network configuration.
    pub fn from_config(config: &NetworkConfig, layout: &PersistentLayout) -> Result<Self, ConfigError> {
        let file = config
            .credential_file
            .clone()
            .unwrap_or_else(|| layout.netid_credential().path().to_path_buf());
        Self::new(&config.credential_env, file, &config.credential_pattern)
    }

    /// Looks the credential up in the process environment and the file.
    #[must_use]
    pub fn load(&self) -> Option<(Credential, CredentialOrigin)> {
        self.load_with(|key| std::env::var(key).ok())
    }

    /// Looks the credential up using `lookup` for the environment.
    ///
    /// Malformed values are discarded with a warning.
    pub fn load_with<F>(&self, lookup: F) -> Option<(Credential, CredentialOrigin)>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(&self.env_var) {
            let value = raw.trim();
            if !value.is_empty() {
                if self.pattern.is_match(value) {
                    debug!(source = %self.env_var, "credential taken from environment");
                    return Some((
                        Credential(value.to_string()),
                        CredentialOrigin::Environment(self.env_var.clone()),
                    ));
                }
                warn!(source = %self.env_var, "discarding malformed credential from environment");
            }
        }

        let text = std::fs::read_to_string(&self.file).ok()?;
        let value = text.lines().next().unwrap_or_default().trim();
        if value.is_empty() {
            return None;
        }
        if self.pattern.is_match(value) {
            debug!(source = %self.file.display(), "credential taken from file");
            Some((Credential(value.to_string()), CredentialOrigin::File(self.file.clone())))
        } else {
            warn!(source = %self.file.display(), "discarding malformed credential from file");
            None
        }
    }
}
