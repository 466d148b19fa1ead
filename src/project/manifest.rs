//! Synthesized `package.json`.
//!
//! Built in three layers: an existing manifest from the tree (or a minimal
//! default), then packages found by the sniffer, then the mandatory runtime
//! and bundler baseline. Earlier layers win: a version already pinned by
//! the user is never replaced.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Default version constraint for discovered packages.
pub const LATEST: &str = "latest";

/// Runtime packages every preview needs.
pub const BASELINE_DEPENDENCIES: &[&str] = &["react", "react-dom"];

/// Bundler toolchain every preview needs.
pub const BASELINE_DEV_DEPENDENCIES: &[&str] = &["vite", "@vitejs/plugin-react"];

/// Extra toolchain added when the project contains TypeScript.
pub const TYPESCRIPT_DEV_DEPENDENCIES: &[&str] = &["typescript", "@types/react", "@types/react-dom"];

/// Known-good version constraints. Packages not listed get [`LATEST`].
const PINNED_VERSIONS: &[(&str, &str)] = &[
    ("react", "^18.2.0"),
    ("react-dom", "^18.2.0"),
    ("vite", "^5.0.8"),
    ("@vitejs/plugin-react", "^4.2.1"),
    ("typescript", "^5.2.2"),
    ("@types/react", "^18.2.43"),
    ("@types/react-dom", "^18.2.17"),
];

/// Packages that belong in `devDependencies` when discovered in source.
const DEV_ONLY: &[&str] = &["vite", "@vitejs/plugin-react", "typescript"];

/// Version constraint for a package: pinned when known, `latest` otherwise.
pub fn version_for(package: &str) -> &'static str {
    PINNED_VERSIONS
        .iter()
        .find(|(name, _)| *name == package)
        .map(|(_, version)| *version)
        .unwrap_or(LATEST)
}

/// Package manifest handed to the sandbox installer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizedManifest {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub private: bool,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub module_type: Option<String>,
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub dev_dependencies: BTreeMap<String, String>,
    /// Fields this crate does not interpret (engines, browserslist, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

impl SynthesizedManifest {
    /// Minimal manifest used when the tree has none (or an unparseable one).
    pub fn minimal(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: default_version(),
            private: true,
            module_type: Some("module".to_string()),
            scripts: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            dev_dependencies: BTreeMap::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Parse a user manifest. Returns `None` on any parse failure so the
    /// caller falls back to [`SynthesizedManifest::minimal`].
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str::<Self>(text) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                tracing::warn!("Ignoring unparseable package.json: {e}");
                None
            }
        }
    }

    /// True when `package` is declared in either dependency map.
    pub fn declares(&self, package: &str) -> bool {
        self.dependencies.contains_key(package) || self.dev_dependencies.contains_key(package)
    }

    /// Merge discovered packages and the baseline toolchain.
    pub fn merge(&mut self, discovered: &BTreeSet<String>, typescript: bool) {
        for package in discovered {
            if self.declares(package) {
                continue;
            }
            let version = version_for(package).to_string();
            if DEV_ONLY.contains(&package.as_str()) {
                self.dev_dependencies.insert(package.clone(), version);
            } else {
                self.dependencies.insert(package.clone(), version);
            }
        }

        for package in BASELINE_DEPENDENCIES {
            if !self.declares(package) {
                self.dependencies
                    .insert((*package).to_string(), version_for(package).to_string());
            }
        }

        let dev_baseline = BASELINE_DEV_DEPENDENCIES.iter().chain(
            typescript
                .then_some(TYPESCRIPT_DEV_DEPENDENCIES)
                .unwrap_or_default(),
        );
        for package in dev_baseline {
            if !self.declares(package) {
                self.dev_dependencies
                    .insert((*package).to_string(), version_for(package).to_string());
            }
        }

        for (script, command) in [("dev", "vite"), ("build", "vite build"), ("preview", "vite preview")] {
            self.scripts
                .entry(script.to_string())
                .or_insert_with(|| command.to_string());
        }
    }

    /// Pretty JSON as written into the sandbox.
    pub fn to_json(&self) -> String {
        // Serializing string maps cannot fail.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn minimal_manifest_gets_baseline_and_dev_script() {
        let mut m = SynthesizedManifest::minimal("demo");
        m.merge(&set(&[]), false);
        assert_eq!(m.dependencies["react"], "^18.2.0");
        assert_eq!(m.dependencies["react-dom"], "^18.2.0");
        assert!(m.dev_dependencies.contains_key("vite"));
        assert!(!m.dev_dependencies.contains_key("typescript"));
        assert_eq!(m.scripts["dev"], "vite");
    }

    #[test]
    fn discovered_unknown_packages_get_latest() {
        let mut m = SynthesizedManifest::minimal("demo");
        m.merge(&set(&["lodash", "@scope/pkg"]), true);
        assert_eq!(m.dependencies["lodash"], LATEST);
        assert_eq!(m.dependencies["@scope/pkg"], LATEST);
        assert_eq!(m.dev_dependencies["typescript"], "^5.2.2");
    }

    #[test]
    fn user_pins_and_scripts_are_preserved() {
        let text = r#"{
            "name": "mine",
            "scripts": { "dev": "vite --host" },
            "dependencies": { "react": "17.0.2", "lodash": "4.17.21" },
            "devDependencies": { "vite": "4.0.0" },
            "browserslist": ["defaults"]
        }"#;
        let mut m = SynthesizedManifest::parse(text).unwrap();
        m.merge(&set(&["react", "lodash", "vite"]), false);

        assert_eq!(m.name, "mine");
        assert_eq!(m.dependencies["react"], "17.0.2");
        assert_eq!(m.dependencies["lodash"], "4.17.21");
        assert_eq!(m.dev_dependencies["vite"], "4.0.0");
        assert!(!m.dependencies.contains_key("vite"));
        assert_eq!(m.scripts["dev"], "vite --host");
        assert_eq!(m.scripts["build"], "vite build");
        assert!(m.extra.contains_key("browserslist"));
    }

    #[test]
    fn unparseable_manifest_is_none() {
        assert!(SynthesizedManifest::parse("{ not json").is_none());
        assert!(SynthesizedManifest::parse(r#"{"version": "1"}"#).is_none());
    }

    #[test]
    fn serialized_manifest_uses_npm_field_names() {
        let mut m = SynthesizedManifest::minimal("demo");
        m.merge(&set(&[]), false);
        let json: serde_json::Value = serde_json::from_str(&m.to_json()).unwrap();
        assert_eq!(json["type"], "module");
        assert!(json["devDependencies"].is_object());
        assert_eq!(json["private"], true);
    }
}
