//! # scforge-orchestrator
//!
//! The build loop for scforge.
//!
//! This crate provides:
//! - A pure state machine for the generate → build → diagnose → repair cycle
//! - `LoopController`, which drives one session through it
//! - An append-only JSON-lines session store
//! - `BuildService`, the asynchronous and blocking entry points
//!
//! ## Key Pattern
//!
//! Every generation call is stateless. The only thing carried from one
//! attempt to the next is the repair context: the source and error
//! diagnostics of the most recent attempt that compiled with errors.

mod loop_controller;
mod service;
mod session_store;
pub mod state_machine;

pub use loop_controller::{LoopController, LoopSettings};
pub use service::{BuildRequest, BuildService};
pub use session_store::{SessionStore, SessionSummary};
