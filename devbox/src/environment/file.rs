//! Append-only persistence for the environment descriptor.

use super::descriptor::EnvironmentDescriptor;
use super::fragment::{is_valid_key, EnvFragment};
use crate::errors::{DevboxError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const HEADER_PREFIX: &str = "# stage: ";

/// The descriptor file on the persistent volume.
#[derive(Debug, Clone)]
pub struct DescriptorFile {
    path: PathBuf,
}

impl DescriptorFile {
    /// Creates a handle for `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one fragment block to the file.
    pub async fn append(&self, fragment: &EnvFragment) -> Result<()> {
        let invalid = fragment.invalid_keys();
        if !invalid.is_empty() {
            return Err(DevboxError::stage_failed(
                &fragment.source,
                format!("invalid environment keys: {}", invalid.join(", ")),
            ));
        }
        // Each entry must stay on one line for `parse` to read it back.
        let multiline = fragment.unrepresentable_values();
        if !multiline.is_empty() {
            return Err(DevboxError::stage_failed(
                &fragment.source,
                format!(
                    "environment values contain line breaks: {}",
                    multiline.join(", ")
                ),
            ));
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let existing_len = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let mut block = String::new();
        if existing_len > 0 {
            block.push('\n');
        }
        block.push_str(&fragment.render());

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(block.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;

        debug!(
            source = %fragment.source,
            keys = fragment.entries.len(),
            path = %self.path.display(),
            "environment fragment appended"
        );
        Ok(())
    }

    /// Loads the descriptor. A missing file yields an empty descriptor.
    pub async fn load(&self) -> Result<EnvironmentDescriptor> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(parse(&text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(EnvironmentDescriptor::new()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Parses rendered descriptor text back into fragments.
#[must_use]
pub fn parse(text: &str) -> EnvironmentDescriptor {
    let mut fragments: Vec<EnvFragment> = Vec::new();

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(source) = line.strip_prefix(HEADER_PREFIX) {
            fragments.push(EnvFragment::new(source.trim()));
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        match parse_export(line) {
            Some((key, value)) => {
                if fragments.is_empty() {
                    fragments.push(EnvFragment::new("unknown"));
                }
                if let Some(current) = fragments.last_mut() {
                    current.push(key, value);
                }
            }
            None => warn!(line = lineno + 1, "ignoring unrecognized descriptor line"),
        }
    }

    EnvironmentDescriptor::from_fragments(fragments)
}

fn parse_export(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("export ").unwrap_or(line).trim_start();
    let (key, raw_value) = rest.split_once('=')?;
    if !is_valid_key(key) {
        return None;
    }
    Some((key.to_string(), unquote(raw_value)?))
}

fn unquote(raw: &str) -> Option<String> {
    if let Some(inner) = raw.strip_prefix('"') {
        let inner = inner.strip_suffix('"')?;
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some(n @ ('"' | '\\' | '`' | '$')) => out.push(n),
                    Some(n) => {
                        out.push('\\');
                        out.push(n);
                    }
                    None => out.push('\\'),
                }
            } else {
                out.push(c);
            }
        }
        Some(out)
    } else if let Some(inner) = raw.strip_prefix('\'') {
        inner.strip_suffix('\'').map(String::from)
    } else {
        Some(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_append_then_load_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = DescriptorFile::new(dir.path().join("env").join("environment.sh"));

        file.append(&EnvFragment::new("a").with("A", "1")).await.unwrap();
        file.append(&EnvFragment::new("b").with("B", "two words")).await.unwrap();
        file.append(&EnvFragment::new("c").with("A", "3")).await.unwrap();

        let descriptor = file.load().await.unwrap();
        assert_eq!(descriptor.sources(), vec!["a", "b", "c"]);
        assert_eq!(descriptor.get("A"), Some("3".to_string()));
        assert_eq!(descriptor.get("B"), Some("two words".to_string()));
    }

    #[tokio::test]
    async fn test_load_missing_is_empty() {
        let file = DescriptorFile::new("/nonexistent/devbox/env.sh");
        assert!(file.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_rejects_bad_keys() {
        let dir = tempfile::tempdir().unwrap();
        let file = DescriptorFile::new(dir.path().join("env.sh"));

        let err = file
            .append(&EnvFragment::new("bad").with("NOT-OK", "1"))
            .await
            .unwrap_err();
        assert_eq!(err.failed_stage(), Some("bad"));
        assert!(!file.path().exists());
    }

    #[tokio::test]
    async fn test_append_rejects_multiline_values() {
        let dir = tempfile::tempdir().unwrap();
        let file = DescriptorFile::new(dir.path().join("env.sh"));
        file.append(&EnvFragment::new("a").with("A", "1")).await.unwrap();
        let before = std::fs::read_to_string(file.path()).unwrap();

        let err = file
            .append(&EnvFragment::new("multi").with("MULTI", "line1\nline2"))
            .await
            .unwrap_err();
        assert_eq!(err.failed_stage(), Some("multi"));
        assert!(err.to_string().contains("MULTI"));

        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), before);
        let descriptor = file.load().await.unwrap();
        assert_eq!(descriptor.sources(), vec!["a"]);
    }

    #[test]
    fn test_parse_hand_written_lines() {
        let text = "export EARLY=1\n\
                    # stage: tools\n\
                    export QUOTED=\"a \\\"b\\\" c\"\n\
                    export SINGLE='x y'\n\
                    BARE=plain\n\
                    this is not an export\n";

        let descriptor = parse(text);
        assert_eq!(descriptor.sources(), vec!["unknown", "tools"]);
        assert_eq!(descriptor.get("QUOTED"), Some("a \"b\" c".to_string()));
        assert_eq!(descriptor.get("SINGLE"), Some("x y".to_string()));
        assert_eq!(descriptor.get("BARE"), Some("plain".to_string()));
    }

    #[test]
    fn test_render_parse_roundtrip_preserves_escapes() {
        let original = EnvironmentDescriptor::from_fragments(vec![EnvFragment::new("s")
            .with("P", "back\\slash `tick` \"q\" $HOME")]);
        let parsed = parse(&original.render());
        assert_eq!(parsed, original);
    }
}
