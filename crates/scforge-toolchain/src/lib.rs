//! # scforge-toolchain
//!
//! Everything scforge does on disk and through the compiler.
//!
//! This crate provides:
//! - Per-session Anchor workspaces with atomic source writes
//! - The `Builder` abstraction over the external toolchain
//! - Program identity extraction from build artifacts

mod builder;
mod identity;
mod scaffold;
mod workspace;

pub use builder::{AnchorBuilder, Artifact, BuildOutput, Builder, ScriptedBuild, ScriptedBuilder};
pub use identity::{declared_program_id, pin_program_id, IdentityExtractor, PLACEHOLDER_PROGRAM_ID};
pub use workspace::{WorkspaceHandle, WorkspaceManager, WorkspaceSnapshot};
