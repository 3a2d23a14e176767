//! Ownership and mode repair for the persistent volume.
//!
//! Volumes mounted from another host often come back owned by a different
//! user. [`reconcile_ownership`] walks the volume and hands everything to the
//! configured uid/gid, descending only into top-level entries that are not
//! already correct, so repeated starts on a healthy volume stay cheap.
//! Failures are collected and logged; some network-backed volumes reject
//! ownership changes and the session must still start.

use std::fs::{self, Metadata};
use std::os::unix::fs::{lchown, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const OWNER_RW: u32 = 0o600;
const OWNER_X: u32 = 0o100;

/// Outcome of [`reconcile_ownership`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OwnershipReport {
    /// Entries examined.
    pub checked: usize,
    /// Entries whose owner or mode was changed.
    pub fixed: usize,
    /// Top-level entries already correct and not descended into.
    pub skipped: Vec<PathBuf>,
    /// Entries that could not be repaired.
    pub failures: Vec<(PathBuf, String)>,
}

impl OwnershipReport {
    /// Returns true if nothing failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Gives `root` and everything below it to `uid:gid` and adds owner
/// read/write (and execute on directories). Never removes mode bits.
#[must_use]
pub fn reconcile_ownership(root: &Path, uid: u32, gid: u32) -> OwnershipReport {
    let mut report = OwnershipReport::default();

    let meta = match fs::symlink_metadata(root) {
        Ok(meta) => meta,
        Err(e) => {
            warn!(path = %root.display(), error = %e, "cannot inspect volume root");
            report.failures.push((root.to_path_buf(), e.to_string()));
            return report;
        }
    };
    repair(root, &meta, uid, gid, &mut report);

    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %root.display(), error = %e, "cannot list volume root");
            report.failures.push((root.to_path_buf(), e.to_string()));
            return report;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) => {
                report.failures.push((path, e.to_string()));
                continue;
            }
        };
        if is_correct(&meta, uid, gid) {
            report.checked += 1;
            debug!(path = %path.display(), "already owned correctly, not descending");
            report.skipped.push(path);
            continue;
        }
        walk(&path, &meta, uid, gid, &mut report);
    }

    for (path, reason) in &report.failures {
        warn!(path = %path.display(), error = %reason, "could not repair ownership");
    }
    info!(
        root = %root.display(),
        uid,
        gid,
        checked = report.checked,
        fixed = report.fixed,
        skipped = report.skipped.len(),
        failures = report.failures.len(),
        "ownership reconciled"
    );
    report
}

fn walk(path: &Path, meta: &Metadata, uid: u32, gid: u32, report: &mut OwnershipReport) {
    repair(path, meta, uid, gid, report);
    if !meta.is_dir() {
        return;
    }

    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) => {
            report.failures.push((path.to_path_buf(), e.to_string()));
            return;
        }
    };
    for entry in entries.flatten() {
        let child = entry.path();
        match fs::symlink_metadata(&child) {
            Ok(child_meta) => walk(&child, &child_meta, uid, gid, report),
            Err(e) => report.failures.push((child, e.to_string())),
        }
    }
}

fn repair(path: &Path, meta: &Metadata, uid: u32, gid: u32, report: &mut OwnershipReport) {
    report.checked += 1;
    let mut changed = false;

    if meta.uid() != uid || meta.gid() != gid {
        match lchown(path, Some(uid), Some(gid)) {
            Ok(()) => changed = true,
            Err(e) => report.failures.push((path.to_path_buf(), format!("chown: {e}"))),
        }
    }

    // Symlink modes are meaningless on Linux.
    if !meta.file_type().is_symlink() {
        let mode = meta.permissions().mode() & 0o7777;
        let wanted = mode | required_bits(meta);
        if wanted != mode {
            match fs::set_permissions(path, fs::Permissions::from_mode(wanted)) {
                Ok(()) => changed = true,
                Err(e) => report.failures.push((path.to_path_buf(), format!("chmod: {e}"))),
            }
        }
    }

    if changed {
        report.fixed += 1;
    }
}

fn required_bits(meta: &Metadata) -> u32 {
    if meta.is_dir() {
        OWNER_RW | OWNER_X
    } else {
        OWNER_RW
    }
}

fn is_correct(meta: &Metadata, uid: u32, gid: u32) -> bool {
    if meta.uid() != uid || meta.gid() != gid {
        return false;
    }
    meta.file_type().is_symlink() || meta.permissions().mode() & required_bits(meta) == required_bits(meta)
}
