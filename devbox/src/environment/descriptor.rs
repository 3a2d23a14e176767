//! Ordered fragment list with last-write-wins resolution.

use super::fragment::{is_valid_key, EnvFragment};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// The accumulated environment of every completed stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    fragments: Vec<EnvFragment>,
}

impl EnvironmentDescriptor {
    /// Creates an empty descriptor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a descriptor from fragments in append order.
    #[must_use]
    pub fn from_fragments(fragments: Vec<EnvFragment>) -> Self {
        Self { fragments }
    }

    /// Appends a fragment. There is no update or remove.
    pub fn append_fragment(&mut self, fragment: EnvFragment) {
        self.fragments.push(fragment);
    }

    /// Returns the fragments in append order.
    #[must_use]
    pub fn fragments(&self) -> &[EnvFragment] {
        &self.fragments
    }

    /// Returns the contributing stage of each fragment, in order.
    #[must_use]
    pub fn sources(&self) -> Vec<&str> {
        self.fragments.iter().map(|f| f.source.as_str()).collect()
    }

    /// Returns the number of fragments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    /// Returns true if nothing has been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Renders the descriptor as shell-sourceable text.
    #[must_use]
    pub fn render(&self) -> String {
        self.fragments
            .iter()
            .map(EnvFragment::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Resolves every key against `base`.
    ///
    /// Fragments are applied in order and a later definition replaces an
    /// earlier one. `$KEY` and `${KEY}` in a value expand to the value
    /// resolved so far, else to `base`, else to the empty string.
    #[must_use]
    pub fn resolve(&self, base: &HashMap<String, String>) -> ResolvedEnv {
        let mut vars: BTreeMap<String, String> = BTreeMap::new();
        for fragment in &self.fragments {
            for (key, value) in &fragment.entries {
                let expanded = expand(value, &vars, base);
                vars.insert(key.clone(), expanded);
            }
        }
        ResolvedEnv { vars }
    }

    /// Resolves against the current process environment.
    #[must_use]
    pub fn resolve_with_process_env(&self) -> ResolvedEnv {
        let base: HashMap<String, String> = std::env::vars().collect();
        self.resolve(&base)
    }

    /// Typed accessor: the final value of `key`, ignoring the process environment.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.resolve(&HashMap::new()).get(key).map(String::from)
    }
}

fn expand(value: &str, resolved: &BTreeMap<String, String>, base: &HashMap<String, String>) -> String {
    let lookup = |name: &str| -> String {
        resolved
            .get(name)
            .or_else(|| base.get(name))
            .cloned()
            .unwrap_or_default()
    };

    let chars: Vec<char> = value.chars().collect();
    let mut out = String::with_capacity(value.len());
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '$' && i + 1 < chars.len() {
            let next = chars[i + 1];
            if next == '{' {
                if let Some(len) = chars[i + 2..].iter().position(|&c| c == '}') {
                    let name: String = chars[i + 2..i + 2 + len].iter().collect();
                    if is_valid_key(&name) {
                        out.push_str(&lookup(&name));
                        i += len + 3;
                        continue;
                    }
                }
            } else if next.is_ascii_alphabetic() || next == '_' {
                let mut end = i + 1;
                while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let name: String = chars[i + 1..end].iter().collect();
                out.push_str(&lookup(&name));
                i = end;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }

    out
}

/// The resolved environment, ready to apply to child processes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedEnv {
    vars: BTreeMap<String, String>,
}

impl ResolvedEnv {
    /// Returns the value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Iterates over resolved pairs sorted by key.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    /// Returns the number of resolved keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Returns true if nothing was resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Returns the underlying map.
    #[must_use]
    pub fn into_map(self) -> BTreeMap<String, String> {
        self.vars
    }

    /// Applies every resolved variable to a command.
    pub fn apply_to(&self, command: &mut tokio::process::Command) {
        command.envs(self.vars.iter());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn base(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_last_write_wins() {
        let mut descriptor = EnvironmentDescriptor::new();
        descriptor.append_fragment(EnvFragment::new("a").with("A", "1"));
        descriptor.append_fragment(EnvFragment::new("b").with("A", "2"));

        assert_eq!(descriptor.get("A"), Some("2".to_string()));
        assert_eq!(descriptor.sources(), vec!["a", "b"]);
    }

    #[test]
    fn test_expansion_prefers_descriptor_then_base() {
        let mut descriptor = EnvironmentDescriptor::new();
        descriptor.append_fragment(
            EnvFragment::new("nvhpc")
                .with("NVHPC_ROOT", "/opt/nvhpc")
                .with("PATH", "${NVHPC_ROOT}/bin:$PATH"),
        );
        descriptor.append_fragment(EnvFragment::new("paraview").with("PATH", "/opt/pv/bin:$PATH"));

        let resolved = descriptor.resolve(&base(&[("PATH", "/usr/bin")]));
        assert_eq!(resolved.get("PATH"), Some("/opt/pv/bin:/opt/nvhpc/bin:/usr/bin"));
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn test_unknown_reference_expands_empty_and_literals_survive() {
        let mut descriptor = EnvironmentDescriptor::new();
        descriptor.append_fragment(
            EnvFragment::new("x")
                .with("A", "pre-$MISSING-post")
                .with("B", "cost $5 and ${not valid}")
                .with("C", "trailing$"),
        );

        let resolved = descriptor.resolve(&HashMap::new());
        assert_eq!(resolved.get("A"), Some("pre--post"));
        assert_eq!(resolved.get("B"), Some("cost $5 and ${not valid}"));
        assert_eq!(resolved.get("C"), Some("trailing$"));
    }

    #[test]
    fn test_render_joins_fragments() {
        let descriptor = EnvironmentDescriptor::from_fragments(vec![
            EnvFragment::new("a").with("A", "1"),
            EnvFragment::new("b").with("B", "2"),
        ]);

        assert_eq!(
            descriptor.render(),
            "# stage: a\nexport A=\"1\"\n\n# stage: b\nexport B=\"2\"\n"
        );
    }

    #[test]
    fn test_sourced_render_matches_resolution() {
        let descriptor = EnvironmentDescriptor::from_fragments(vec![
            EnvFragment::new("a").with("A", "1").with("Q", "say \"hi\" `x`"),
            EnvFragment::new("b").with("A", "2"),
        ]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.sh");
        std::fs::write(&path, descriptor.render()).unwrap();

        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!(". '{}'; printf '%s|%s' \"$A\" \"$Q\"", path.display()))
            .output()
            .unwrap();

        assert_eq!(String::from_utf8_lossy(&output.stdout), "2|say \"hi\" `x`");
    }
}
