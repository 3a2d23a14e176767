//! Configuration for the install pipeline and session bring-up.
//!
//! Configuration is a TOML document. Every field has a default, so an empty
//! file (or no file at all) yields a usable configuration with no stages.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "DEVBOX_CONFIG";
/// Environment variable overriding `volume_root`.
pub const VOLUME_ENV: &str = "DEVBOX_VOLUME";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevboxConfig {
    /// Root of the persistent volume.
    #[serde(default = "default_volume_root")]
    pub volume_root: PathBuf,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Download settings.
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Network identity service.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Remote access daemon.
    #[serde(default)]
    pub remote_access: RemoteAccessConfig,
    /// Ownership repair on the volume.
    #[serde(default)]
    pub ownership: OwnershipConfig,
    /// Install stages, in execution order.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

fn default_volume_root() -> PathBuf {
    PathBuf::from("/workspace/.devbox")
}

impl Default for DevboxConfig {
    fn default() -> Self {
        Self {
            volume_root: default_volume_root(),
            logging: LoggingConfig::default(),
            fetch: FetchConfig::default(),
            network: NetworkConfig::default(),
            remote_access: RemoteAccessConfig::default(),
            ownership: OwnershipConfig::default(),
            stages: Vec::new(),
        }
    }
}

impl DevboxConfig {
    /// Loads configuration.
    ///
    /// Uses `path` if given, else the file named by `DEVBOX_CONFIG`, else
    /// defaults. `DEVBOX_VOLUME` overrides the volume root in every case.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let chosen = path.map(Path::to_path_buf).or(env_path);

        let mut config = match chosen {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };

        if let Some(volume) = std::env::var_os(VOLUME_ENV) {
            config.volume_root = PathBuf::from(volume);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from TOML text without validating it.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Sets the volume root.
    #[must_use]
    pub fn with_volume_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.volume_root = root.into();
        self
    }

    /// Checks cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        let mut markers = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(ConfigError::Invalid("stage name must not be empty".into()));
            }
            if !names.insert(stage.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            if !markers.insert(stage.marker_id()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate marker id '{}'",
                    stage.marker_id()
                )));
            }
            if let Some(fetch) = stage.fetch.as_ref().filter(|f| f.extract_to.is_some()) {
                let file_name = fetch.resolved_file_name();
                if let Err(e) = crate::fetch::ArchiveKind::from_path(Path::new(&file_name)) {
                    return Err(ConfigError::Invalid(format!(
                        "stage '{}' cannot extract its download: {e}",
                        stage.name
                    )));
                }
            }
        }

        if let Err(e) = regex::Regex::new(&self.network.credential_pattern) {
            return Err(ConfigError::Invalid(format!("credential_pattern: {e}")));
        }

        let watcher = &self.network.watcher;
        if watcher.floor_ms == 0 || watcher.floor_ms > watcher.ceiling_ms {
            return Err(ConfigError::Invalid(format!(
                "watcher floor_ms ({}) must be non-zero and not exceed ceiling_ms ({})",
                watcher.floor_ms, watcher.ceiling_ms
            )));
        }

        if self.network.readiness_attempts == 0 {
            return Err(ConfigError::Invalid("readiness_attempts must be at least 1".into()));
        }

        Ok(())
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

/// Download settings shared by all strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Connections for the segmented downloader.
    #[serde(default = "default_connections")]
    pub connections: u32,
    /// Retry count for the resuming strategies.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Fixed delay between retries in seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Hand over to the next available strategy when the selected one fails.
    #[serde(default)]
    pub fall_through: bool,
}

fn default_connections() -> u32 {
    16
}

fn default_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    5
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connections: default_connections(),
            retries: default_retries(),
            retry_delay_secs: default_retry_delay(),
            fall_through: false,
        }
    }
}

/// Network identity client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Whether to bring the service up at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Daemon binary.
    #[serde(default = "default_daemon_binary")]
    pub daemon_binary: String,
    /// Client binary.
    #[serde(default = "default_client_binary")]
    pub client_binary: String,
    /// Extra daemon arguments.
    #[serde(default = "default_daemon_args")]
    pub daemon_args: Vec<String>,
    /// Hostname to register with.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Environment variable holding the credential.
    #[serde(default = "default_credential_env")]
    pub credential_env: String,
    /// Credential file; defaults to the durable auth key path on the volume.
    #[serde(default)]
    pub credential_file: Option<PathBuf>,
    /// Pattern a credential must match before it is used.
    #[serde(default = "default_credential_pattern")]
    pub credential_pattern: String,
    /// Readiness poll attempts.
    #[serde(default = "default_readiness_attempts")]
    pub readiness_attempts: u32,
    /// Sleep between readiness polls in milliseconds.
    #[serde(default = "default_readiness_interval")]
    pub readiness_interval_ms: u64,
    /// Consecutive readiness timeouts (across restarts) before transient state is cleared.
    #[serde(default = "default_cleanup_after")]
    pub cleanup_after_timeouts: u32,
    /// Client arguments run once connectivity is up.
    #[serde(default = "default_secondary_access")]
    pub secondary_access: Vec<String>,
    /// Background watcher timing.
    #[serde(default)]
    pub watcher: WatcherConfig,
}

fn default_true() -> bool {
    true
}

fn default_daemon_binary() -> String {
    "tailscaled".to_string()
}

fn default_client_binary() -> String {
    "tailscale".to_string()
}

fn default_daemon_args() -> Vec<String> {
    vec!["--tun=userspace-networking".to_string()]
}

fn default_credential_env() -> String {
    "TS_AUTHKEY".to_string()
}

fn default_credential_pattern() -> String {
    r"^tskey-[A-Za-z0-9][A-Za-z0-9_-]{8,}$".to_string()
}

fn default_readiness_attempts() -> u32 {
    15
}

fn default_readiness_interval() -> u64 {
    1000
}

fn default_cleanup_after() -> u32 {
    2
}

fn default_secondary_access() -> Vec<String> {
    vec!["set".to_string(), "--ssh".to_string()]
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daemon_binary: default_daemon_binary(),
            client_binary: default_client_binary(),
            daemon_args: default_daemon_args(),
            hostname: None,
            credential_env: default_credential_env(),
            credential_file: None,
            credential_pattern: default_credential_pattern(),
            readiness_attempts: default_readiness_attempts(),
            readiness_interval_ms: default_readiness_interval(),
            cleanup_after_timeouts: default_cleanup_after(),
            secondary_access: default_secondary_access(),
            watcher: WatcherConfig::default(),
        }
    }
}

impl NetworkConfig {
    /// Gets the readiness poll interval as a Duration.
    #[must_use]
    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }
}

/// Background watcher timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// First poll interval in milliseconds.
    #[serde(default = "default_floor")]
    pub floor_ms: u64,
    /// Upper bound on the poll interval in milliseconds.
    #[serde(default = "default_ceiling")]
    pub ceiling_ms: u64,
    /// Total time the watcher may run, in seconds.
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u64,
}

fn default_floor() -> u64 {
    500
}

fn default_ceiling() -> u64 {
    30_000
}

fn default_max_duration() -> u64 {
    600
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            floor_ms: default_floor(),
            ceiling_ms: default_ceiling(),
            max_duration_secs: default_max_duration(),
        }
    }
}

/// Remote access daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteAccessConfig {
    /// Whether to start the daemon.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Daemon binary.
    #[serde(default = "default_sshd_binary")]
    pub sshd_binary: String,
    /// Key generation binary.
    #[serde(default = "default_keygen_binary")]
    pub keygen_binary: String,
    /// Listen port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Listen address.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Host key types to maintain.
    #[serde(default = "default_key_types")]
    pub key_types: Vec<String>,
    /// Allow password authentication.
    #[serde(default)]
    pub password_authentication: bool,
}

fn default_sshd_binary() -> String {
    "/usr/sbin/sshd".to_string()
}

fn default_keygen_binary() -> String {
    "ssh-keygen".to_string()
}

fn default_ssh_port() -> u16 {
    2222
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_key_types() -> Vec<String> {
    vec!["ed25519".to_string(), "rsa".to_string()]
}

impl Default for RemoteAccessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sshd_binary: default_sshd_binary(),
            keygen_binary: default_keygen_binary(),
            port: default_ssh_port(),
            listen_address: default_listen_address(),
            key_types: default_key_types(),
            password_authentication: false,
        }
    }
}

/// Ownership repair settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnershipConfig {
    /// Whether to repair ownership at startup.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Expected owner.
    #[serde(default = "default_id")]
    pub uid: u32,
    /// Expected group.
    #[serde(default = "default_id")]
    pub gid: u32,
}

fn default_id() -> u32 {
    1000
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            uid: default_id(),
            gid: default_id(),
        }
    }
}

/// One declared install stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageConfig {
    /// Unique stage name.
    pub name: String,
    /// Marker id; defaults to the name.
    #[serde(default)]
    pub marker: Option<String>,
    /// Optional download performed before the commands.
    #[serde(default)]
    pub fetch: Option<StageFetchConfig>,
    /// Shell commands, run in order with the environment descriptor applied.
    #[serde(default)]
    pub commands: Vec<String>,
    /// Working directory for the commands.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// Environment fragment appended on success.
    #[serde(default)]
    pub env: Vec<EnvEntry>,
    /// Paths that must exist once the commands finish.
    #[serde(default)]
    pub expects: Vec<PathBuf>,
}

impl StageConfig {
    /// Returns the marker id for this stage.
    #[must_use]
    pub fn marker_id(&self) -> &str {
        self.marker.as_deref().unwrap_or(&self.name)
    }
}

/// A download belonging to a stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageFetchConfig {
    /// Source URI.
    pub uri: String,
    /// File name under the downloads directory; defaults to the URI's last segment.
    #[serde(default)]
    pub file_name: Option<String>,
    /// Expected sha256 (hex).
    #[serde(default)]
    pub sha256: Option<String>,
    /// Extract the archive into this directory.
    #[serde(default)]
    pub extract_to: Option<PathBuf>,
}

impl StageFetchConfig {
    /// Resolves the local file name.
    #[must_use]
    pub fn resolved_file_name(&self) -> String {
        self.file_name.clone().unwrap_or_else(|| {
            let trimmed = self.uri.split(['?', '#']).next().unwrap_or(&self.uri);
            trimmed
                .rsplit('/')
                .find(|s| !s.is_empty())
                .unwrap_or("download")
                .to_string()
        })
    }
}

/// One `KEY=VALUE` entry of an environment fragment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvEntry {
    /// Variable name.
    pub key: String,
    /// Value; may reference earlier keys as `$KEY` or `${KEY}`.
    pub value: String,
}
