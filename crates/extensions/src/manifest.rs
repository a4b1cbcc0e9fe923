//! Extension manifests.
//!
//! Each extension directory carries a `manifest.toml`:
//!
//! ```toml
//! name = "greeter"
//! version = "1.2.0"
//! entry_point = "greeter"
//! implements = ["welcome"]
//!
//! [dependencies]
//! console = "^0.1"
//!
//! [[capabilities]]
//! name = "greeter.hello"
//! version = "1.0.0"
//! kind = "action"
//!
//! [config.threshold]
//! type = "int"
//! default = 5
//! ```
//!
//! A parsed [`ExtensionDescriptor`] is immutable for the session.

use parley_config::SettingSchema;
use parley_core::capability::CapabilityKind;
use parley_core::error::LoadError;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name looked up in every extension directory.
pub const MANIFEST_FILE: &str = "manifest.toml";

/// Names no extension may take; `core` owns the bot's own identity.
const RESERVED_NAMES: &[&str] = &["core"];

/// A capability an extension promises to register.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapabilityDecl {
    pub name: String,
    pub version: Version,
    pub kind: CapabilityKind,
}

/// The static description of an extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtensionDescriptor {
    /// Unique extension name; also its settings and data namespace
    pub name: String,

    pub version: Version,

    /// Catalog key of the factory; defaults to `name`
    #[serde(default)]
    pub entry_point: String,

    #[serde(default = "default_author")]
    pub author: String,

    #[serde(default = "default_license")]
    pub license: String,

    #[serde(default = "default_summary")]
    pub summary: String,

    #[serde(default)]
    pub description: String,

    /// Alias names this extension satisfies in other manifests' dependencies
    #[serde(default)]
    pub implements: Vec<String>,

    /// Required extensions (by name or alias) and version ranges
    #[serde(default)]
    pub dependencies: BTreeMap<String, VersionReq>,

    /// Load after these when present and compatible; ignored otherwise
    #[serde(default)]
    pub optional_dependencies: BTreeMap<String, VersionReq>,

    #[serde(default)]
    pub capabilities: Vec<CapabilityDecl>,

    /// Settings declared in this extension's namespace before it loads
    #[serde(default)]
    pub config: BTreeMap<String, SettingSchema>,

    /// Directory the manifest was read from; `None` for bundled extensions
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

fn default_author() -> String {
    "Unknown".into()
}
fn default_license() -> String {
    "No license".into()
}
fn default_summary() -> String {
    "No summary provided.".into()
}

fn valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
}

impl ExtensionDescriptor {
    /// Parse and validate manifest text. `origin` names the source in errors.
    pub fn from_toml(text: &str, origin: &str) -> Result<Self, LoadError> {
        let mut descriptor: Self = toml::from_str(text).map_err(|e| LoadError::Manifest {
            path: origin.to_string(),
            reason: e.to_string(),
        })?;
        if descriptor.entry_point.is_empty() {
            descriptor.entry_point = descriptor.name.clone();
        }
        descriptor.validate().map_err(|reason| LoadError::Manifest {
            path: origin.to_string(),
            reason,
        })?;
        Ok(descriptor)
    }

    /// Read `<dir>/manifest.toml`.
    pub fn load(dir: &Path) -> Result<Self, LoadError> {
        let path = dir.join(MANIFEST_FILE);
        let origin = path.display().to_string();
        let text = std::fs::read_to_string(&path).map_err(|e| LoadError::Manifest {
            path: origin.clone(),
            reason: e.to_string(),
        })?;
        let mut descriptor = Self::from_toml(&text, &origin)?;
        descriptor.path = Some(dir.to_path_buf());
        Ok(descriptor)
    }

    fn validate(&self) -> Result<(), String> {
        if !valid_identifier(&self.name) {
            return Err(format!(
                "name '{}' must be non-empty and contain only ASCII letters, digits, '-', '_' or '.'",
                self.name
            ));
        }
        if RESERVED_NAMES.contains(&self.name.as_str()) {
            return Err(format!("name '{}' is reserved", self.name));
        }

        let mut aliases = BTreeSet::new();
        for alias in &self.implements {
            if !valid_identifier(alias) {
                return Err(format!("implements entry '{alias}' is not a valid name"));
            }
            if alias == &self.name || !aliases.insert(alias) {
                return Err(format!("implements entry '{alias}' is duplicated"));
            }
        }

        for dep in self.dependencies.keys().chain(self.optional_dependencies.keys()) {
            if dep == &self.name || aliases.contains(dep) {
                return Err(format!("extension cannot depend on itself ('{dep}')"));
            }
        }
        if let Some(both) = self
            .dependencies
            .keys()
            .find(|d| self.optional_dependencies.contains_key(*d))
        {
            return Err(format!("'{both}' is both a required and an optional dependency"));
        }

        let mut seen = BTreeSet::new();
        for cap in &self.capabilities {
            if cap.name.trim().is_empty() {
                return Err("capability name must not be empty".into());
            }
            if !seen.insert((cap.kind, &cap.name, &cap.version)) {
                return Err(format!(
                    "capability {} '{}' {} is declared twice",
                    cap.kind, cap.name, cap.version
                ));
            }
        }

        for (key, schema) in &self.config {
            if key.trim().is_empty() {
                return Err("config key must not be empty".into());
            }
            if !schema.ty.accepts(&schema.default) {
                return Err(format!(
                    "config '{key}' default {} does not match type {}",
                    schema.default, schema.ty
                ));
            }
        }

        Ok(())
    }

    /// Every name this extension satisfies: its own plus its aliases.
    pub fn provides(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.implements.iter().map(String::as_str))
    }

    /// Whether `capability` of `kind` at `version` is declared.
    pub fn declares(&self, kind: CapabilityKind, name: &str, version: &Version) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.kind == kind && c.name == name && &c.version == version)
    }
}

/// Result of scanning an extension root.
#[derive(Debug, Default)]
pub struct Discovery {
    /// Valid manifests, ordered by directory name
    pub descriptors: Vec<ExtensionDescriptor>,

    /// Directories whose manifest could not be read or validated
    pub errors: Vec<LoadError>,
}

/// Scan `root/*/manifest.toml`. A missing root yields an empty discovery.
pub fn discover(root: &Path) -> Discovery {
    let mut discovery = Discovery::default();
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(root = %root.display(), error = %e, "Extension root not readable");
            return discovery;
        }
    };

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.join(MANIFEST_FILE).is_file())
        .collect();
    dirs.sort();

    for dir in dirs {
        match ExtensionDescriptor::load(&dir) {
            Ok(descriptor) => discovery.descriptors.push(descriptor),
            Err(e) => {
                warn!(error = %e, "Skipping extension with invalid manifest");
                discovery.errors.push(e);
            }
        }
    }
    discovery
}

/// Add discovered manifests to `descriptors`. One with the name of an
/// existing descriptor replaces it.
pub fn overlay(descriptors: &mut Vec<ExtensionDescriptor>, discovered: Vec<ExtensionDescriptor>) {
    for found in discovered {
        match descriptors.iter_mut().find(|d| d.name == found.name) {
            Some(existing) => {
                warn!(
                    extension = %found.name,
                    replaced = %existing.version,
                    discovered = %found.version,
                    "Discovered manifest replaces the bundled one"
                );
                *existing = found;
            }
            None => descriptors.push(found),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::value::ValueType;
    use serde_json::json;

    const GREETER: &str = r#"
name = "greeter"
version = "1.2.0"
author = "someone"
implements = ["welcome"]

[dependencies]
console = "^0.1"

[optional_dependencies]
stats = ">=1.0"

[[capabilities]]
name = "greeter.hello"
version = "1.0.0"
kind = "action"

[config.threshold]
type = "int"
default = 5
description = "Messages before greeting"
"#;

    #[test]
    fn parses_full_manifest() {
        let d = ExtensionDescriptor::from_toml(GREETER, "greeter").unwrap();
        assert_eq!(d.name, "greeter");
        assert_eq!(d.entry_point, "greeter");
        assert_eq!(d.version, Version::new(1, 2, 0));
        assert_eq!(d.license, "No license");
        assert!(d.dependencies["console"].matches(&Version::new(0, 1, 4)));
        assert!(d.declares(CapabilityKind::Action, "greeter.hello", &Version::new(1, 0, 0)));
        assert_eq!(d.config["threshold"].ty, ValueType::Int);
        assert_eq!(d.config["threshold"].default, json!(5));
        assert_eq!(d.provides().collect::<Vec<_>>(), vec!["greeter", "welcome"]);
    }

    #[test]
    fn rejects_bad_versions_and_unknown_fields() {
        let err = ExtensionDescriptor::from_toml("name = \"x\"\nversion = \"one\"", "x").unwrap_err();
        assert!(matches!(err, LoadError::Manifest { .. }));

        let err = ExtensionDescriptor::from_toml(
            "name = \"x\"\nversion = \"1.0.0\"\nrequires = [\"y\"]",
            "x",
        )
        .unwrap_err();
        assert!(err.to_string().contains("requires"));
    }

    #[test]
    fn rejects_semantic_problems() {
        let cases = [
            ("name = \"core\"\nversion = \"1.0.0\"", "reserved"),
            ("name = \"a b\"\nversion = \"1.0.0\"", "ASCII"),
            (
                "name = \"a\"\nversion = \"1.0.0\"\n[dependencies]\na = \"*\"",
                "itself",
            ),
            (
                "name = \"a\"\nversion = \"1.0.0\"\n[dependencies]\nb = \"*\"\n[optional_dependencies]\nb = \"*\"",
                "both",
            ),
            (
                "name = \"a\"\nversion = \"1.0.0\"\n[config.n]\ntype = \"int\"\ndefault = \"five\"",
                "does not match",
            ),
            (
                "name = \"a\"\nversion = \"1.0.0\"\n[[capabilities]]\nname = \"c\"\nversion = \"1.0.0\"\nkind = \"action\"\n[[capabilities]]\nname = \"c\"\nversion = \"1.0.0\"\nkind = \"action\"",
                "twice",
            ),
        ];
        for (text, needle) in cases {
            let err = ExtensionDescriptor::from_toml(text, "test").unwrap_err();
            assert!(err.to_string().contains(needle), "{needle}: {err}");
        }
    }

    #[test]
    fn discover_reads_each_directory() {
        let root = tempfile::tempdir().unwrap();
        for (dir, text) in [
            ("greeter", GREETER),
            ("console", "name = \"console\"\nversion = \"0.1.0\""),
            ("broken", "name = "),
        ] {
            std::fs::create_dir(root.path().join(dir)).unwrap();
            std::fs::write(root.path().join(dir).join(MANIFEST_FILE), text).unwrap();
        }
        std::fs::create_dir(root.path().join("not-an-extension")).unwrap();

        let found = discover(root.path());
        let names: Vec<_> = found.descriptors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["console", "greeter"]);
        assert_eq!(found.errors.len(), 1);
        assert_eq!(
            found.descriptors[1].path.as_deref(),
            Some(root.path().join("greeter").as_path())
        );
    }

    #[test]
    fn missing_root_is_empty() {
        let found = discover(Path::new("/nonexistent/parley/extensions"));
        assert!(found.descriptors.is_empty());
        assert!(found.errors.is_empty());
    }

    #[test]
    fn overlay_replaces_by_name() {
        let bundled = |name: &str| {
            ExtensionDescriptor::from_toml(&format!("name = \"{name}\"\nversion = \"1.0.0\""), name).unwrap()
        };
        let mut descriptors = vec![bundled("console"), bundled("echo")];
        let disk = ExtensionDescriptor::from_toml("name = \"echo\"\nversion = \"1.1.0\"", "echo").unwrap();

        overlay(&mut descriptors, vec![disk, bundled("greeter")]);
        let names: Vec<_> = descriptors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["console", "echo", "greeter"]);
        assert_eq!(descriptors[1].version, Version::new(1, 1, 0));
    }
}
