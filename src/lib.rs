//! sandpreview: live preview orchestration for in-memory web projects.
//!
//! A [`project::ProjectFileTree`] is synthesized into a mountable project,
//! mounted into a sandbox, installed and served by a
//! [`session::SandboxSession`]. Later edits go through the
//! [`reload::HotReloadCoordinator`], which picks the cheapest way to apply
//! them.

pub mod config;
pub mod output;
pub mod preview;
pub mod project;
pub mod reload;
pub mod sandbox;
pub mod session;
