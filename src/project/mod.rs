//! Project model: the editor-owned file tree and the pure transformations
//! that turn it into something a sandbox can mount and install.
//!
//! - [`ProjectFileTree`]: ordered forest of [`FileNode`]s, owned by the editor
//! - [`vfs::VirtualFilesystemTree`]: the mount structure handed to the sandbox
//! - [`manifest::SynthesizedManifest`]: the generated `package.json`
//! - [`sniff`] / [`synth`]: dependency discovery and project synthesis
//!
//! Nothing in this module performs I/O except [`ProjectFileTree::load_dir`].

pub mod manifest;
pub mod sniff;
pub mod synth;
pub mod vfs;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Directories skipped when loading a project from disk.
const SKIP_DIRS: &[&str] = &["node_modules", ".next", ".git", "dist", "build", ".cache"];

/// Kind of a [`FileNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

/// A single node of the editor's file tree.
///
/// `name` may embed `/` separators (`"components/Button.tsx"`); such a file
/// is treated as nested under its declared parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// `None` only for unpopulated directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
}

impl FileNode {
    pub fn file(name: impl Into<String>, content: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            kind: NodeKind::File,
            content: Some(content.into()),
            children: None,
        }
    }

    pub fn dir(name: impl Into<String>, children: Vec<FileNode>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            kind: NodeKind::Directory,
            content: None,
            children: Some(children),
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    /// File content, empty when absent.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// Immutable snapshot of the editor's file tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectFileTree {
    pub roots: Vec<FileNode>,
}

impl ProjectFileTree {
    pub fn new(roots: Vec<FileNode>) -> Self {
        Self { roots }
    }

    /// True when the tree contains no files at all.
    pub fn is_empty(&self) -> bool {
        self.files().is_empty()
    }

    /// All files in depth-first traversal order, paired with their paths.
    pub fn files(&self) -> Vec<(String, &FileNode)> {
        let mut out = Vec::new();
        for node in &self.roots {
            collect_files(node, "", &mut out);
        }
        out
    }

    /// Check the structural invariants of the tree.
    ///
    /// Violations are the "catastrophic malformation" class of synthesis
    /// errors: a file with children, a directory with content, an empty or
    /// `..` path segment, or two siblings sharing a name.
    pub fn validate(&self) -> Result<(), String> {
        validate_siblings(&self.roots, "")
    }

    /// Load a project directory from disk into a tree.
    ///
    /// Build artifacts and VCS metadata are skipped, as are files that are
    /// not valid UTF-8. Children are sorted by name so the result is stable.
    pub fn load_dir(root: &Path) -> anyhow::Result<Self> {
        anyhow::ensure!(root.is_dir(), "Not a directory: {}", root.display());
        let roots = load_children(root, root)?;
        Ok(Self { roots })
    }
}

fn collect_files<'a>(node: &'a FileNode, prefix: &str, out: &mut Vec<(String, &'a FileNode)>) {
    let path = join_path(prefix, &node.name);
    match node.kind {
        NodeKind::File => out.push((path, node)),
        NodeKind::Directory => {
            for child in node.children.iter().flatten() {
                collect_files(child, &path, out);
            }
        }
    }
}

/// Join a parent path and a (possibly slash-embedded) node name.
pub fn join_path(prefix: &str, name: &str) -> String {
    let name = name.trim_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn validate_siblings(nodes: &[FileNode], prefix: &str) -> Result<(), String> {
    let mut seen = HashSet::new();
    for node in nodes {
        let path = join_path(prefix, &node.name);
        if node.name.trim_matches('/').is_empty() {
            return Err(format!("empty node name under '{prefix}'"));
        }
        if node.name.split('/').any(|seg| seg == "..") {
            return Err(format!("path escapes project root: {path}"));
        }
        if !seen.insert(node.name.as_str()) {
            return Err(format!("duplicate sibling name: {path}"));
        }
        match node.kind {
            NodeKind::File if node.children.is_some() => {
                return Err(format!("file node has children: {path}"));
            }
            NodeKind::Directory if node.content.is_some() => {
                return Err(format!("directory node has content: {path}"));
            }
            NodeKind::Directory => {
                if let Some(children) = &node.children {
                    validate_siblings(children, &path)?;
                }
            }
            NodeKind::File => {}
        }
    }
    Ok(())
}

fn load_children(root: &Path, dir: &Path) -> anyhow::Result<Vec<FileNode>> {
    let mut nodes = Vec::new();
    let walker = walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to read {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        let id = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");

        if entry.file_type().is_dir() {
            if SKIP_DIRS.contains(&name.as_str()) {
                continue;
            }
            nodes.push(FileNode {
                id,
                name,
                kind: NodeKind::Directory,
                content: None,
                children: Some(load_children(root, entry.path())?),
            });
        } else if entry.file_type().is_file() {
            let bytes = std::fs::read(entry.path())
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            match String::from_utf8(bytes) {
                Ok(content) => nodes.push(FileNode {
                    id,
                    name,
                    kind: NodeKind::File,
                    content: Some(content),
                    children: None,
                }),
                Err(_) => tracing::debug!("Skipping non-UTF-8 file {}", entry.path().display()),
            }
        }
    }

    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> ProjectFileTree {
        ProjectFileTree::new(vec![
            FileNode::file("App.tsx", "export default () => null;"),
            FileNode::dir(
                "src",
                vec![
                    FileNode::file("util.ts", "export const x = 1;"),
                    FileNode::file("components/Button.tsx", "export {}"),
                ],
            ),
        ])
    }

    #[test]
    fn files_are_listed_in_traversal_order_with_paths() {
        let tree = sample();
        let paths: Vec<String> = tree.files().into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["App.tsx", "src/util.ts", "src/components/Button.tsx"]);
    }

    #[test]
    fn empty_tree_and_empty_directories_count_as_empty() {
        assert!(ProjectFileTree::default().is_empty());
        let tree = ProjectFileTree::new(vec![FileNode::dir("src", vec![])]);
        assert!(tree.is_empty());
    }

    #[test]
    fn validate_accepts_well_formed_tree() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_siblings() {
        let tree = ProjectFileTree::new(vec![
            FileNode::file("a.js", ""),
            FileNode::file("a.js", "x"),
        ]);
        let err = tree.validate().unwrap_err();
        assert!(err.contains("duplicate"));
    }

    #[test]
    fn validate_rejects_file_with_children_and_parent_escape() {
        let mut bad = FileNode::file("a.js", "");
        bad.children = Some(vec![]);
        assert!(ProjectFileTree::new(vec![bad]).validate().is_err());

        let escape = ProjectFileTree::new(vec![FileNode::file("../etc/passwd", "")]);
        assert!(escape.validate().unwrap_err().contains("escapes"));
    }

    #[test]
    fn tree_round_trips_through_editor_json() {
        let json = r#"[{"id":"1","name":"index.js","type":"file","content":"hi"},
                       {"id":"2","name":"lib","type":"directory"}]"#;
        let tree: ProjectFileTree = serde_json::from_str(json).unwrap();
        assert_eq!(tree.roots.len(), 2);
        assert_eq!(tree.roots[0].text(), "hi");
        assert!(tree.roots[1].children.is_none());
    }

    #[test]
    fn load_dir_skips_build_artifacts() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::create_dir_all(tmp.path().join("node_modules/react")).unwrap();
        std::fs::write(tmp.path().join("src/App.jsx"), "export default 1").unwrap();
        std::fs::write(tmp.path().join("node_modules/react/index.js"), "x").unwrap();
        std::fs::write(tmp.path().join("logo.bin"), [0xff, 0xfe, 0x00]).unwrap();

        let tree = ProjectFileTree::load_dir(tmp.path()).unwrap();
        let paths: Vec<String> = tree.files().into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["src/App.jsx"]);
        assert_eq!(tree.roots[0].id, "src");
    }

    #[test]
    fn load_dir_rejects_missing_directory() {
        let tmp = TempDir::new().unwrap();
        assert!(ProjectFileTree::load_dir(&tmp.path().join("nope")).is_err());
    }
}
