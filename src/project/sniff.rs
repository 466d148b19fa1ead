//! Dependency sniffer: infer external packages from import statements.
//!
//! This is a text scan, not a parser. Commented-out imports and imports
//! inside string literals are picked up too; the cost of a spurious
//! `"latest"` dependency is lower than a missing one.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Extensions whose files are scanned for imports.
pub const SOURCE_EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx", "mjs", "cjs"];

fn import_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // import x from "m"; import { a } from 'm'; export * from "m"
            r#"(?m)\b(?:import|export)\s+(?:type\s+)?[\w*{}\s,$]*?\s*from\s*["']([^"'\n]+)["']"#,
            // import "m";
            r#"(?m)\bimport\s*["']([^"'\n]+)["']"#,
            // import("m") / require("m")
            r#"\b(?:import|require)\s*\(\s*["']([^"'\n]+)["']\s*\)"#,
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// True when `name` has one of the [`SOURCE_EXTENSIONS`].
pub fn is_source_file(name: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(_, ext)| SOURCE_EXTENSIONS.contains(&ext))
}

/// Reduce an import specifier to its installable package name.
///
/// Returns `None` for relative/absolute paths and scheme-prefixed
/// specifiers such as `node:fs`.
pub fn package_name(specifier: &str) -> Option<String> {
    let spec = specifier.trim();
    if spec.is_empty() || spec.starts_with('.') || spec.starts_with('/') || spec.contains(':') {
        return None;
    }

    let mut segments = spec.split('/');
    let first = segments.next()?;
    if first.starts_with('@') {
        match segments.next() {
            Some(second) if !second.is_empty() => Some(format!("{first}/{second}")),
            _ => Some(first.to_string()),
        }
    } else {
        Some(first.to_string())
    }
}

/// Packages referenced by a single source text.
pub fn sniff_source(source: &str) -> BTreeSet<String> {
    import_patterns()
        .iter()
        .flat_map(|re| re.captures_iter(source))
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| package_name(m.as_str()))
        .collect()
}

/// Packages referenced across `files` (`(name_or_path, contents)` pairs).
/// Files without a recognised source extension are ignored.
pub fn sniff<'a, I>(files: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    files
        .into_iter()
        .filter(|(name, _)| is_source_file(name))
        .flat_map(|(_, source)| sniff_source(source))
        .collect()
}
