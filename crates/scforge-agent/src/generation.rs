//! Generation collaborator boundary

use async_trait::async_trait;
use scforge_core::{ContractSpecification, Diagnostic, ForgeError, GenerationMode, Result};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Produces contract source from a specification
///
/// Implementations hold no conversation state: everything a call needs is
/// in its arguments.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Source for a fresh program
    async fn generate(&self, spec: &ContractSpecification) -> Result<String>;

    /// Corrected source given the failed source and its error diagnostics
    async fn repair(
        &self,
        spec: &ContractSpecification,
        prior_source: &str,
        diagnostics: &[Diagnostic],
    ) -> Result<String>;
}

/// Canned reply for a [`ScriptedGenerator`]
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Source(String),
    Fail(String),
    /// Never returns, so the caller's timeout or cancellation fires
    Hang,
}

impl ScriptedResponse {
    pub fn source(source: impl Into<String>) -> Self {
        Self::Source(source.into())
    }
}

/// One call observed by a [`ScriptedGenerator`]
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationCall {
    pub mode: GenerationMode,
    pub prior_source: Option<String>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Scripted generator for testing
///
/// Replays responses in order regardless of call type and records every
/// call so tests can assert on repair inputs.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    calls: Mutex<Vec<GenerationCall>>,
}

impl ScriptedGenerator {
    pub fn new(responses: impl IntoIterator<Item = ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<GenerationCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn respond(&self, call: GenerationCall) -> Result<String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);

        let next = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        match next {
            Some(ScriptedResponse::Source(source)) => Ok(source),
            Some(ScriptedResponse::Fail(message)) => Err(ForgeError::Generation(message)),
            Some(ScriptedResponse::Hang) => std::future::pending().await,
            None => Err(ForgeError::Generation(
                "No scripted response left".to_string(),
            )),
        }
    }
}

#[async_trait]
impl GenerationClient for ScriptedGenerator {
    async fn generate(&self, _spec: &ContractSpecification) -> Result<String> {
        self.respond(GenerationCall {
            mode: GenerationMode::Generate,
            prior_source: None,
            diagnostics: Vec::new(),
        })
        .await
    }

    async fn repair(
        &self,
        _spec: &ContractSpecification,
        prior_source: &str,
        diagnostics: &[Diagnostic],
    ) -> Result<String> {
        self.respond(GenerationCall {
            mode: GenerationMode::Repair,
            prior_source: Some(prior_source.to_string()),
            diagnostics: diagnostics.to_vec(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scforge_core::ContractKind;
    use std::time::Duration;

    #[tokio::test]
    async fn test_replays_in_order_and_records() {
        let spec = ContractSpecification::new(ContractKind::Escrow, "Test Escrow");
        let generator = ScriptedGenerator::new([
            ScriptedResponse::source("// one"),
            ScriptedResponse::Fail("overloaded".to_string()),
        ]);

        assert_eq!(generator.generate(&spec).await.unwrap(), "// one");

        let diag = Diagnostic::synthetic("boom");
        let err = generator
            .repair(&spec, "// one", std::slice::from_ref(&diag))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Generation(_)));

        assert!(generator.generate(&spec).await.is_err());

        let calls = generator.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].mode, GenerationMode::Generate);
        assert_eq!(calls[1].mode, GenerationMode::Repair);
        assert_eq!(calls[1].prior_source.as_deref(), Some("// one"));
        assert_eq!(calls[1].diagnostics, vec![diag]);
    }

    #[tokio::test]
    async fn test_hang_never_resolves() {
        let spec = ContractSpecification::new(ContractKind::Custom, "x");
        let generator = ScriptedGenerator::new([ScriptedResponse::Hang]);

        let result = tokio::time::timeout(Duration::from_millis(20), generator.generate(&spec)).await;
        assert!(result.is_err());
    }
}
