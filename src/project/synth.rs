//! Project synthesizer: editor file tree → mountable, installable project.
//!
//! Given an arbitrary and possibly incomplete tree (a lone `App.tsx` is
//! enough) this produces a Vite + React project: a merged `package.json`,
//! an `index.html`, a `vite.config.js`, and, when the tree has a root
//! component but no entry point, a generated entry that mounts it.
//!
//! Scaffold files are regenerated on every call and overwrite any
//! same-named top-level user file.

use super::manifest::SynthesizedManifest;
use super::vfs::VirtualFilesystemTree;
use super::{join_path, sniff, FileNode, NodeKind, ProjectFileTree};
use thiserror::Error;

pub const MANIFEST_FILE: &str = "package.json";
pub const HTML_FILE: &str = "index.html";
pub const BUNDLER_CONFIG_FILE: &str = "vite.config.js";

/// Conventional entry points, in priority order.
const ENTRY_CANDIDATES: &[&str] = &[
    "main.tsx", "main.jsx", "main.ts", "main.js", "index.tsx", "index.jsx", "index.ts", "index.js",
];

/// Conventional root component names, in priority order.
const ROOT_COMPONENT_CANDIDATES: &[&str] = &["App.tsx", "App.jsx", "App.js", "App.ts"];

/// Directories searched for entry points and root components.
const CONVENTIONAL_DIRS: &[&str] = &["", "src"];

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("Malformed project tree: {0}")]
    Malformed(String),
}

/// Knobs that are not derived from the tree itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthOptions {
    /// Package name used when the tree has no usable manifest.
    pub project_name: String,
    /// Port the dev server binds inside the sandbox.
    pub dev_port: u16,
}

impl Default for SynthOptions {
    fn default() -> Self {
        Self {
            project_name: "sandbox-project".to_string(),
            dev_port: 3000,
        }
    }
}

/// Output of [`synthesize`].
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub vfs: VirtualFilesystemTree,
    pub manifest: SynthesizedManifest,
    /// Path of the entry module referenced by `index.html`, if any.
    pub entry: Option<String>,
    /// True when `entry` was generated rather than found in the tree.
    pub generated_entry: bool,
}

/// Synthesize a buildable project from `tree`. Pure and deterministic.
pub fn synthesize(tree: &ProjectFileTree, options: &SynthOptions) -> Result<Synthesis, SynthesisError> {
    tree.validate().map_err(SynthesisError::Malformed)?;

    let files: Vec<(String, &FileNode)> = tree.files();

    let manifest_text = files
        .iter()
        .find(|(path, _)| path == MANIFEST_FILE)
        .or_else(|| files.iter().find(|(path, _)| file_name(path) == MANIFEST_FILE))
        .map(|(_, node)| node.text());

    let stylesheet = files
        .iter()
        .filter(|(path, _)| path.ends_with(".css"))
        .map(|(_, node)| node.text())
        .collect::<Vec<_>>()
        .join("\n");

    let existing_entry = find_conventional(&files, ENTRY_CANDIDATES);
    let root_component = find_conventional(&files, ROOT_COMPONENT_CANDIDATES);

    let discovered = sniff::sniff(files.iter().map(|(path, node)| (path.as_str(), node.text())));
    let typescript = files
        .iter()
        .any(|(path, _)| path.ends_with(".ts") || path.ends_with(".tsx"));

    let mut manifest = manifest_text
        .and_then(SynthesizedManifest::parse)
        .unwrap_or_else(|| SynthesizedManifest::minimal(&options.project_name));
    manifest.merge(&discovered, typescript);

    let mut vfs = VirtualFilesystemTree::new();
    for node in &tree.roots {
        translate(node, "", &mut vfs);
    }

    let (entry, generated_entry) = match (existing_entry, root_component) {
        (Some(entry), _) => (Some(entry), false),
        (None, Some(component)) => {
            let (path, source) = generated_entry_file(&component);
            vfs.insert_file(&path, source);
            (Some(path), true)
        }
        (None, None) => (None, false),
    };

    vfs.insert_file(MANIFEST_FILE, manifest.to_json());
    vfs.insert_file(
        HTML_FILE,
        index_html(&manifest.name, entry.as_deref(), &stylesheet),
    );
    vfs.insert_file(BUNDLER_CONFIG_FILE, bundler_config(options.dev_port));

    tracing::debug!(
        files = vfs.file_count(),
        dependencies = manifest.dependencies.len(),
        generated_entry,
        "Synthesized project"
    );

    Ok(Synthesis {
        vfs,
        manifest,
        entry,
        generated_entry,
    })
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn find_conventional(files: &[(String, &FileNode)], candidates: &[&str]) -> Option<String> {
    for candidate in candidates {
        for dir in CONVENTIONAL_DIRS {
            let wanted = join_path(dir, candidate);
            if files.iter().any(|(path, _)| *path == wanted) {
                return Some(wanted);
            }
        }
    }
    None
}

fn translate(node: &FileNode, prefix: &str, vfs: &mut VirtualFilesystemTree) {
    let path = join_path(prefix, &node.name);
    match node.kind {
        NodeKind::File => vfs.insert_file(&path, node.text()),
        NodeKind::Directory => {
            vfs.ensure_dir(&path);
            for child in node.children.iter().flatten() {
                translate(child, &path, vfs);
            }
        }
    }
}

/// Entry module for a tree that has a root component but no entry point.
fn generated_entry_file(component: &str) -> (String, String) {
    let typescript = component.ends_with(".ts") || component.ends_with(".tsx");
    let path = if typescript { "main.tsx" } else { "main.jsx" };
    let component_module = component
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(component);
    let non_null = if typescript { "!" } else { "" };

    let source = format!(
        "import React from 'react';
import ReactDOM from 'react-dom/client';
import App from './{component_module}';

ReactDOM.createRoot(document.getElementById('root'){non_null}).render(
  <React.StrictMode>
    <App />
  </React.StrictMode>,
);
"
    );
    (path.to_string(), source)
}

fn index_html(title: &str, entry: Option<&str>, stylesheet: &str) -> String {
    let style = if stylesheet.trim().is_empty() {
        String::new()
    } else {
        format!("    <style>\n{stylesheet}\n    </style>\n")
    };
    let script = entry
        .map(|e| format!("    <script type=\"module\" src=\"/{e}\"></script>\n"))
        .unwrap_or_default();

    format!(
        "<!doctype html>
<html lang=\"en\">
  <head>
    <meta charset=\"UTF-8\" />
    <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\" />
    <title>{title}</title>
{style}  </head>
  <body>
    <div id=\"root\"></div>
{script}  </body>
</html>
"
    )
}

fn bundler_config(port: u16) -> String {
    format!(
        "import {{ defineConfig }} from 'vite';
import react from '@vitejs/plugin-react';

export default defineConfig({{
  plugins: [react()],
  server: {{
    host: '0.0.0.0',
    port: {port},
    strictPort: true,
  }},
}});
"
    )
}
