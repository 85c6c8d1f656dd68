//! API key lookup for the Anthropic adapter

use scforge_core::{ForgeError, Result};
use std::env;

/// Read the API key from the named environment variable
///
/// An unset or blank variable is an `Auth` error naming the variable.
pub fn api_key_from_env(var: &str) -> Result<String> {
    match env::var(var) {
        Ok(key) if !key.trim().is_empty() => {
            tracing::debug!("Using API key from {}", var);
            Ok(key.trim().to_string())
        }
        _ => Err(ForgeError::Auth(format!(
            "No API key found. Set {}=sk-ant-... or change generation.api_key_env",
            var
        ))),
    }
}
