//! Mount structure consumed by sandbox providers.
//!
//! Serializes to the nested shape sandboxes expect:
//! `{"src": {"directory": {"main.tsx": {"file": {"contents": "..."}}}}}`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One entry of a [`VirtualFilesystemTree`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VfsEntry {
    File { contents: String },
    Directory(VirtualFilesystemTree),
}

/// Path segment → file or directory. Keys are kept sorted so two syntheses
/// of the same tree compare and serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VirtualFilesystemTree {
    entries: BTreeMap<String, VfsEntry>,
}

impl VirtualFilesystemTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a file at a slash-separated path, creating intermediate
    /// directories. An existing entry at the same path is replaced; a file
    /// sitting where a directory is needed is replaced by that directory.
    pub fn insert_file(&mut self, path: &str, contents: impl Into<String>) {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some((file_name, dirs)) = segments.split_last() else {
            return;
        };

        let mut current = self;
        for dir in dirs {
            let entry = current
                .entries
                .entry((*dir).to_string())
                .or_insert_with(|| VfsEntry::Directory(VirtualFilesystemTree::new()));
            if !matches!(entry, VfsEntry::Directory(_)) {
                *entry = VfsEntry::Directory(VirtualFilesystemTree::new());
            }
            let VfsEntry::Directory(tree) = entry else {
                return;
            };
            current = tree;
        }

        current.entries.insert(
            (*file_name).to_string(),
            VfsEntry::File {
                contents: contents.into(),
            },
        );
    }

    /// Ensure a (possibly empty) directory exists at `path`.
    pub fn ensure_dir(&mut self, path: &str) {
        let mut current = self;
        for dir in path.split('/').filter(|s| !s.is_empty()) {
            let entry = current
                .entries
                .entry(dir.to_string())
                .or_insert_with(|| VfsEntry::Directory(VirtualFilesystemTree::new()));
            current = match entry {
                VfsEntry::Directory(tree) => tree,
                VfsEntry::File { .. } => return,
            };
        }
    }

    /// Look up the contents of a file by slash-separated path.
    pub fn get_file(&self, path: &str) -> Option<&str> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let (file_name, dirs) = segments.split_last()?;
        let mut current = self;
        for dir in dirs {
            match current.entries.get(*dir)? {
                VfsEntry::Directory(tree) => current = tree,
                VfsEntry::File { .. } => return None,
            }
        }
        match current.entries.get(*file_name)? {
            VfsEntry::File { contents } => Some(contents),
            VfsEntry::Directory(_) => None,
        }
    }

    /// Flatten into `(path, contents)` pairs, sorted by path.
    pub fn files(&self) -> Vec<(String, &str)> {
        let mut out = Vec::new();
        self.collect("", &mut out);
        out
    }

    /// Number of files (directories excluded).
    pub fn file_count(&self) -> usize {
        self.entries
            .values()
            .map(|entry| match entry {
                VfsEntry::File { .. } => 1,
                VfsEntry::Directory(tree) => tree.file_count(),
            })
            .sum()
    }

    /// Directories (including empty ones), sorted by path.
    pub fn directories(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_dirs("", &mut out);
        out
    }

    pub fn entries(&self) -> &BTreeMap<String, VfsEntry> {
        &self.entries
    }

    fn collect<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a str)>) {
        for (name, entry) in &self.entries {
            let path = super::join_path(prefix, name);
            match entry {
                VfsEntry::File { contents } => out.push((path, contents.as_str())),
                VfsEntry::Directory(tree) => tree.collect(&path, out),
            }
        }
    }

    fn collect_dirs(&self, prefix: &str, out: &mut Vec<String>) {
        for (name, entry) in &self.entries {
            if let VfsEntry::Directory(tree) = entry {
                let path = super::join_path(prefix, name);
                out.push(path.clone());
                tree.collect_dirs(&path, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_insert_builds_directories() {
        let mut vfs = VirtualFilesystemTree::new();
        vfs.insert_file("src/components/Button.tsx", "btn");
        vfs.insert_file("index.html", "<html>");

        assert_eq!(vfs.file_count(), 2);
        assert_eq!(vfs.get_file("src/components/Button.tsx"), Some("btn"));
        assert_eq!(vfs.directories(), vec!["src", "src/components"]);
    }

    #[test]
    fn insert_overwrites_existing_file() {
        let mut vfs = VirtualFilesystemTree::new();
        vfs.insert_file("index.html", "user");
        vfs.insert_file("index.html", "scaffold");
        assert_eq!(vfs.get_file("index.html"), Some("scaffold"));
        assert_eq!(vfs.file_count(), 1);
    }

    #[test]
    fn nested_insert_replaces_file_in_the_way() {
        let mut vfs = VirtualFilesystemTree::new();
        vfs.insert_file("lib", "was a file");
        vfs.insert_file("lib/util.js", "util");
        assert_eq!(vfs.get_file("lib"), None);
        assert_eq!(vfs.get_file("lib/util.js"), Some("util"));
        assert_eq!(vfs.directories(), vec!["lib"]);
    }

    #[test]
    fn serializes_to_mount_shape() {
        let mut vfs = VirtualFilesystemTree::new();
        vfs.insert_file("src/a.js", "x");
        let json = serde_json::to_value(&vfs).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "src": { "directory": { "a.js": { "file": { "contents": "x" } } } }
            })
        );
    }

    #[test]
    fn ensure_dir_keeps_empty_directories() {
        let mut vfs = VirtualFilesystemTree::new();
        vfs.ensure_dir("public/assets");
        assert_eq!(vfs.file_count(), 0);
        assert_eq!(vfs.directories(), vec!["public", "public/assets"]);
    }

    #[test]
    fn files_are_sorted_by_path() {
        let mut vfs = VirtualFilesystemTree::new();
        vfs.insert_file("b.js", "");
        vfs.insert_file("a/z.js", "");
        let paths: Vec<String> = vfs.files().into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["a/z.js", "b.js"]);
    }
}
