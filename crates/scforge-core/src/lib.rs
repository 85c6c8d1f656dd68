//! # scforge-core
//!
//! Core types for scforge, the generate → build → diagnose → repair loop
//! that turns a contract specification into a compiled Anchor program.
//!
//! This crate provides:
//! - The session data model (specifications, attempts, sessions)
//! - The unified error type
//! - Repository configuration
//! - The toolchain diagnostic parser

mod config;
pub mod diagnostics;
mod error;
pub mod fail_open;
mod types;

pub use config::{
    ForgeConfig, GenerationConfig, LoopDefaults, StoreConfig, ToolchainConfig, WorkspaceConfig,
    FORGE_DIR,
};
pub use diagnostics::{Diagnostic, Severity, SourceLocation};
pub use error::{ForgeError, Result};
pub use types::*;
