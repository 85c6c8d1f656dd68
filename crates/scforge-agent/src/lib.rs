//! # scforge-agent
//!
//! The generation collaborator for scforge.
//!
//! This crate provides:
//! - The `GenerationClient` trait (generate and repair)
//! - `AnthropicGenerator`, a stateless Messages API adapter with retry
//!   backoff and a circuit breaker
//! - `ScriptedGenerator` for tests
//!
//! No conversation history is kept between calls. A repair call receives the
//! failed source and its error diagnostics and nothing else.

mod auth;
mod circuit_breaker;
mod client;
mod extract;
mod generation;
pub mod prompt;
mod types;

pub use auth::api_key_from_env;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use client::{AnthropicGenerator, RetryPolicy};
pub use extract::extract_source;
pub use generation::{GenerationCall, GenerationClient, ScriptedGenerator, ScriptedResponse};
pub use types::{Model, Usage};
