//! Paths on the persistent volume and their durability class.
//!
//! Every path devbox persists is either [`StateClass::Durable`] (identity,
//! credentials, markers, the environment descriptor) or
//! [`StateClass::Transient`] (sockets, lock files, rendered config, scratch
//! downloads). Only transient paths can be removed through
//! [`PersistedPath::remove`].

use crate::errors::{DevboxError, Result};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Whether a path must survive restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    /// Recreating it changes the identity presented externally.
    Durable,
    /// Safe to delete; rebuilt on the next bring-up.
    Transient,
}

/// A path tagged with its durability class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PersistedPath {
    path: PathBuf,
    class: StateClass,
}

impl PersistedPath {
    /// Creates a durable path.
    #[must_use]
    pub fn durable(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            class: StateClass::Durable,
        }
    }

    /// Creates a transient path.
    #[must_use]
    pub fn transient(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            class: StateClass::Transient,
        }
    }

    /// Returns the path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the durability class.
    #[must_use]
    pub fn class(&self) -> StateClass {
        self.class
    }

    /// Returns true for durable paths.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.class == StateClass::Durable
    }

    /// Returns true if something exists at the path (including dangling symlinks).
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.symlink_metadata().is_ok()
    }

    /// Deletes a transient path.
    ///
    /// Returns `Ok(false)` if nothing was there. Durable paths are never
    /// touched and yield [`DevboxError::DurableStateProtected`].
    pub fn remove(&self) -> Result<bool> {
        if self.is_durable() {
            return Err(DevboxError::DurableStateProtected(self.path.clone()));
        }

        let meta = match self.path.symlink_metadata() {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let result = if meta.is_dir() {
            std::fs::remove_dir_all(&self.path)
        } else {
            std::fs::remove_file(&self.path)
        };

        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl AsRef<Path> for PersistedPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Layout of the persistent volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentLayout {
    root: PathBuf,
}

impl PersistentLayout {
    /// Creates a layout rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the volume root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Completion markers.
    #[must_use]
    pub fn markers_dir(&self) -> PersistedPath {
        PersistedPath::durable(self.root.join("markers"))
    }

    /// The environment descriptor.
    #[must_use]
    pub fn descriptor_file(&self) -> PersistedPath {
        PersistedPath::durable(self.root.join("env").join("environment.sh"))
    }

    /// Scratch space for downloads.
    #[must_use]
    pub fn downloads_dir(&self) -> PersistedPath {
        PersistedPath::transient(self.root.join("downloads"))
    }

    /// Network identity service directory.
    #[must_use]
    pub fn netid_dir(&self) -> PathBuf {
        self.root.join("services").join("netid")
    }

    /// Network identity daemon state (the node identity).
    #[must_use]
    pub fn netid_state(&self) -> PersistedPath {
        PersistedPath::durable(self.netid_dir().join("state"))
    }

    /// Persisted single-line credential.
    #[must_use]
    pub fn netid_credential(&self) -> PersistedPath {
        PersistedPath::durable(self.netid_dir().join("authkey"))
    }

    /// Daemon control socket.
    #[must_use]
    pub fn netid_socket(&self) -> PersistedPath {
        PersistedPath::transient(self.netid_dir().join("daemon.sock"))
    }

    /// Daemon lock file.
    #[must_use]
    pub fn netid_lock(&self) -> PersistedPath {
        PersistedPath::transient(self.netid_dir().join("daemon.lock"))
    }

    /// Consecutive readiness timeout counter.
    #[must_use]
    pub fn readiness_ledger(&self) -> PersistedPath {
        PersistedPath::transient(self.netid_dir().join("readiness.failures"))
    }

    /// Paths the scoped cleanup may delete.
    #[must_use]
    pub fn netid_transient(&self) -> Vec<PersistedPath> {
        vec![self.netid_socket(), self.netid_lock(), self.readiness_ledger()]
    }

    /// Paths that carry the node identity.
    #[must_use]
    pub fn netid_durable(&self) -> Vec<PersistedPath> {
        vec![self.netid_state(), self.netid_credential()]
    }

    /// Remote access directory.
    #[must_use]
    pub fn ssh_dir(&self) -> PathBuf {
        self.root.join("ssh")
    }

    /// Private host key for a key type.
    #[must_use]
    pub fn ssh_host_key(&self, key_type: &str) -> PersistedPath {
        PersistedPath::durable(self.ssh_dir().join(format!("ssh_host_{key_type}_key")))
    }

    /// Public host key for a key type.
    #[must_use]
    pub fn ssh_host_key_pub(&self, key_type: &str) -> PersistedPath {
        PersistedPath::durable(self.ssh_dir().join(format!("ssh_host_{key_type}_key.pub")))
    }

    /// Deletes the public half of a host key whose private half is gone, so
    /// a fresh pair can be generated.
    ///
    /// Returns `Ok(false)` if there was no public key. While the private key
    /// exists the pair is intact and this yields
    /// [`DevboxError::DurableStateProtected`]. This is the only way a durable
    /// path is ever deleted.
    pub fn remove_orphan_host_key_pub(&self, key_type: &str) -> Result<bool> {
        let public = self.ssh_host_key_pub(key_type);
        if self.ssh_host_key(key_type).exists() {
            return Err(DevboxError::DurableStateProtected(public.path().to_path_buf()));
        }
        match std::fs::remove_file(public.path()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Rendered daemon configuration.
    #[must_use]
    pub fn sshd_config(&self) -> PersistedPath {
        PersistedPath::transient(self.ssh_dir().join("sshd_config"))
    }

    /// Daemon pid file.
    #[must_use]
    pub fn sshd_pid(&self) -> PersistedPath {
        PersistedPath::transient(self.ssh_dir().join("sshd.pid"))
    }

    /// Creates the directories of the layout.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.markers_dir().path().to_path_buf(),
            self.root.join("env"),
            self.downloads_dir().path().to_path_buf(),
            self.netid_dir(),
            self.ssh_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
