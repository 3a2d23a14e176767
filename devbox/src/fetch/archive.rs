//! Archive extraction.

use crate::errors::ExtractError;
use crate::process::{CommandRunner, CommandSpec};
use flate2::read::GzDecoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

/// Archive formats recognised by file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    /// `.tar.gz` / `.tgz`
    TarGz,
    /// `.tar`
    Tar,
    /// `.zip`
    Zip,
    /// `.tar.xz` / `.txz`, unpacked by the system `tar`.
    TarXz,
    /// `.tar.bz2` / `.tbz2`, unpacked by the system `tar`.
    TarBz2,
}

impl ArchiveKind {
    /// Determines the format from the file name suffix.
    pub fn from_path(path: &Path) -> Result<Self, ExtractError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        let kind = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Self::TarGz
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Self::TarXz
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            Self::TarBz2
        } else if name.ends_with(".tar") {
            Self::Tar
        } else if name.ends_with(".zip") {
            Self::Zip
        } else {
            return Err(ExtractError::UnsupportedArchive(path.to_path_buf()));
        };
        Ok(kind)
    }
}

/// Extracts `archive` into `dest`, creating `dest` if needed.
pub async fn extract_archive(
    archive: &Path,
    dest: &Path,
    runner: &dyn CommandRunner,
) -> Result<(), ExtractError> {
    let kind = ArchiveKind::from_path(archive)?;
    let failed = |reason: String| ExtractError::Failed {
        path: archive.to_path_buf(),
        reason,
    };

    tokio::fs::create_dir_all(dest)
        .await
        .map_err(|e| failed(e.to_string()))?;

    info!(archive = %archive.display(), dest = %dest.display(), ?kind, "extracting");

    match kind {
        ArchiveKind::TarXz | ArchiveKind::TarBz2 => {
            let flag = if kind == ArchiveKind::TarXz { "-xJf" } else { "-xjf" };
            let spec = CommandSpec::new("tar").args([
                flag.to_string(),
                archive.display().to_string(),
                "-C".to_string(),
                dest.display().to_string(),
            ]);
            runner
                .run_checked(&spec)
                .await
                .map(|_| ())
                .map_err(|e| failed(e.to_string()))
        }
        native => {
            let archive_path = archive.to_path_buf();
            let dest_path = dest.to_path_buf();
            tokio::task::spawn_blocking(move || unpack_native(native, &archive_path, &dest_path))
                .await
                .map_err(|e| failed(e.to_string()))?
                .map_err(failed)
        }
    }
}

fn unpack_native(kind: ArchiveKind, archive: &Path, dest: &Path) -> Result<(), String> {
    let file = File::open(archive).map_err(|e| e.to_string())?;
    match kind {
        ArchiveKind::TarGz => tar::Archive::new(GzDecoder::new(file))
            .unpack(dest)
            .map_err(|e| e.to_string()),
        ArchiveKind::Tar => tar::Archive::new(file)
            .unpack(dest)
            .map_err(|e| e.to_string()),
        ArchiveKind::Zip => zip::ZipArchive::new(file)
            .and_then(|mut zip| zip.extract(dest))
            .map_err(|e| e.to_string()),
        other => Err(format!("{other:?} is not unpacked natively")),
    }
}

/// Returns the directory an archive is extracted into by default.
#[must_use]
pub fn default_extract_dir(archive: &Path) -> PathBuf {
    archive
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRunner;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_kind_from_suffix() {
        assert_eq!(ArchiveKind::from_path(Path::new("a.tar.gz")).unwrap(), ArchiveKind::TarGz);
        assert_eq!(ArchiveKind::from_path(Path::new("A.TGZ")).unwrap(), ArchiveKind::TarGz);
        assert_eq!(ArchiveKind::from_path(Path::new("a.tar")).unwrap(), ArchiveKind::Tar);
        assert_eq!(ArchiveKind::from_path(Path::new("a.zip")).unwrap(), ArchiveKind::Zip);
        assert_eq!(ArchiveKind::from_path(Path::new("a.tar.xz")).unwrap(), ArchiveKind::TarXz);
        assert_eq!(ArchiveKind::from_path(Path::new("a.tbz2")).unwrap(), ArchiveKind::TarBz2);
        assert!(matches!(
            ArchiveKind::from_path(Path::new("a.rar")),
            Err(ExtractError::UnsupportedArchive(_))
        ));
    }

    #[tokio::test]
    async fn test_extract_tar_gz() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("tool.tar.gz");

        let gz = GzEncoder::new(File::create(&archive).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(gz);
        let data = b"#!/bin/sh\necho hi\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "tool/bin/run", &data[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let dest = dir.path().join("out");
        extract_archive(&archive, &dest, &FakeRunner::new()).await.unwrap();
        assert_eq!(std::fs::read(dest.join("tool/bin/run")).unwrap(), data);
    }

    #[tokio::test]
    async fn test_extract_zip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("tool.zip");

        let mut writer = zip::ZipWriter::new(File::create(&archive).unwrap());
        writer
            .start_file("docs/readme.txt", zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(b"hello").unwrap();
        writer.finish().unwrap();

        let dest = dir.path().join("out");
        extract_archive(&archive, &dest, &FakeRunner::new()).await.unwrap();
        assert_eq!(std::fs::read(dest.join("docs/readme.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_xz_goes_through_system_tar() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("tool.tar.xz");
        let runner = FakeRunner::new().with_tool("tar");

        extract_archive(&archive, &dir.path().join("out"), &runner)
            .await
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "tar");
        assert_eq!(calls[0].args[0], "-xJf");
    }

    #[tokio::test]
    async fn test_corrupt_archive_fails() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bad.zip");
        std::fs::write(&archive, b"not a zip").unwrap();

        let err = extract_archive(&archive, &dir.path().join("out"), &FakeRunner::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Failed { .. }));
    }
}
