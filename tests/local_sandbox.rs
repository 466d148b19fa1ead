#![cfg(unix)]

use sandpreview::output::LineKind;
use sandpreview::project::{FileNode, ProjectFileTree};
use sandpreview::reload::{HotReloadCoordinator, ReloadOutcome};
use sandpreview::sandbox::local::LocalProvider;
use sandpreview::sandbox::SandboxContext;
use sandpreview::session::{CommandSpec, LifecycleState, SandboxSession, SessionOptions};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn sh(script: &str) -> CommandSpec {
    CommandSpec::new("sh", &["-c", script])
}

fn options(install: &str, dev: &str) -> SessionOptions {
    SessionOptions {
        install: sh(install),
        dev: sh(dev),
        ..SessionOptions::default()
    }
}

fn session(workdir: &Path, options: SessionOptions) -> Arc<SandboxSession> {
    let provider = Arc::new(LocalProvider::new(workdir.to_path_buf()));
    SandboxSession::new(Arc::new(SandboxContext::new(provider)), options)
}

fn project(greeting: &str) -> ProjectFileTree {
    ProjectFileTree::new(vec![
        FileNode::file(
            "App.jsx",
            format!("import React from 'react';\nimport confetti from 'canvas-confetti';\nexport default () => <h1>{greeting}</h1>;\n"),
        ),
        FileNode::file("styles.css", "h1 { color: teal; }"),
    ])
}

const INSTALL_OK: &str = "test -f package.json && echo 'added 1 package in 0.1s'";
// Backgrounded like a real dev server under `npm run dev`: the server is a grandchild.
const DEV_SERVER: &str = "echo 'VITE ready in 12 ms'; echo '  ➜  Local:   http://localhost:4321/'; sleep 30 & wait";

#[tokio::test]
async fn local_session_boots_to_ready_and_reloads() {
    let tmp = TempDir::new().unwrap();
    let workdir = tmp.path().join("project");
    let session = session(&workdir, options(INSTALL_OK, DEV_SERVER));
    let coordinator = HotReloadCoordinator::new(Arc::clone(&session));

    let outcome = coordinator.on_change(&project("hello")).await.unwrap();
    assert_eq!(outcome, ReloadOutcome::Booted(LifecycleState::Ready));
    assert_eq!(session.endpoint().as_deref(), Some("http://localhost:4321"));

    let manifest = std::fs::read_to_string(workdir.join("package.json")).unwrap();
    assert!(manifest.contains("canvas-confetti"));
    assert!(manifest.contains("react-dom"));
    let html = std::fs::read_to_string(workdir.join("index.html")).unwrap();
    assert!(html.contains("color: teal"));
    assert!(workdir.join("main.jsx").is_file());

    let outcome = coordinator.on_change(&project("again")).await.unwrap();
    assert!(matches!(outcome, ReloadOutcome::Remounted { .. }));
    let app = std::fs::read_to_string(workdir.join("App.jsx")).unwrap();
    assert!(app.contains("again"));
    assert_eq!(session.state(), LifecycleState::Ready);

    session.shutdown().await;
    assert_eq!(session.state(), LifecycleState::Idle);
}

#[tokio::test]
async fn local_install_failure_reports_exit_code() {
    let tmp = TempDir::new().unwrap();
    let session = session(
        tmp.path(),
        options("echo 'npm ERR! code E404' >&2; exit 1", DEV_SERVER),
    );

    let state = session.boot_and_run(&project("x")).await.unwrap();
    assert_eq!(state, LifecycleState::Error);
    assert_eq!(session.exit_code(), Some(1));
    assert!(session.endpoint().is_none());

    let snapshot = session.snapshot();
    assert!(snapshot.error.unwrap().contains("exit code 1"));
    assert!(snapshot
        .log
        .iter()
        .any(|l| l.kind == LineKind::Error && l.text.contains("E404")));
}

#[tokio::test]
async fn local_dev_server_exit_before_ready_is_start_failure() {
    let tmp = TempDir::new().unwrap();
    let session = session(
        tmp.path(),
        options(INSTALL_OK, "echo 'Error: Cannot find module vite'; exit 2"),
    );

    let state = session.boot_and_run(&project("x")).await.unwrap();
    assert_eq!(state, LifecycleState::Error);
    assert_eq!(session.exit_code(), Some(2));
}

#[tokio::test]
async fn local_restart_replaces_dev_server() {
    let tmp = TempDir::new().unwrap();
    let session = session(tmp.path(), options(INSTALL_OK, DEV_SERVER));

    session.boot_and_run(&project("one")).await.unwrap();
    let state = session.restart(&project("two")).await.unwrap();
    assert_eq!(state, LifecycleState::Ready);
    assert_eq!(session.endpoint().as_deref(), Some("http://localhost:4321"));
    assert!(session.log().iter().all(|l| !l.text.contains("exited")));

    session.shutdown().await;
}
