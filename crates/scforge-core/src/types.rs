//! Core type definitions for scforge build sessions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::diagnostics::{Diagnostic, Severity};
use crate::{ForgeError, Result};

/// Program id used in `declare_id!` until the toolchain assigns a real one
pub const PLACEHOLDER_PROGRAM_ID: &str = "11111111111111111111111111111111";

/// Kind of contract to generate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractKind {
    Escrow,
    TokenVesting,
    Crowdfunding,
    Custom,
}

impl std::fmt::Display for ContractKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Escrow => write!(f, "escrow"),
            Self::TokenVesting => write!(f, "token_vesting"),
            Self::Crowdfunding => write!(f, "crowdfunding"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

impl std::str::FromStr for ContractKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "escrow" => Ok(Self::Escrow),
            "token_vesting" | "vesting" => Ok(Self::TokenVesting),
            "crowdfunding" => Ok(Self::Crowdfunding),
            "custom" => Ok(Self::Custom),
            _ => Err(format!(
                "Invalid contract kind: {}. Use escrow, token_vesting, crowdfunding, or custom.",
                s
            )),
        }
    }
}

/// User-supplied description of the program to generate
///
/// Created once per request and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractSpecification {
    pub kind: ContractKind,
    pub name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl ContractSpecification {
    pub fn new(kind: ContractKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Anchor program crate name derived from the contract name
    ///
    /// Falls back to the kind when the name has no usable characters.
    pub fn program_name(&self) -> String {
        let mut out = String::new();
        let mut pending_sep = false;
        let mut prev_lower = false;

        for c in self.name.trim().chars() {
            if c.is_ascii_alphanumeric() {
                if c.is_ascii_uppercase() && prev_lower {
                    pending_sep = true;
                }
                if pending_sep && !out.is_empty() {
                    out.push('_');
                }
                pending_sep = false;
                prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
                out.push(c.to_ascii_lowercase());
            } else {
                pending_sep = true;
                prev_lower = false;
            }
        }

        if out.is_empty() {
            return self.kind.to_string();
        }
        if out.starts_with(|c: char| c.is_ascii_digit()) {
            out.insert(0, '_');
        }
        out
    }
}

/// Unique identifier of a build session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| format!("Invalid session id {}: {}", s, e))
    }
}

/// Whether an attempt asked for fresh source or a repair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    Generate,
    Repair,
}

/// Outcome of one generate-and-compile cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    ToolError,
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::ToolError => write!(f, "tool_error"),
        }
    }
}

/// One generation + compile cycle within a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildAttempt {
    /// 1-based, strictly increasing within a session
    pub sequence: u32,
    pub mode: GenerationMode,
    /// Source text produced by the generation step (empty if generation failed)
    pub source: String,
    /// Raw toolchain output, stdout followed by stderr
    pub raw_output: String,
    pub exit_code: Option<i32>,
    pub diagnostics: Vec<Diagnostic>,
    pub outcome: AttemptOutcome,
    /// Tool failure message for `ToolError` attempts
    pub tool_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BuildAttempt {
    /// Error-severity diagnostics, in emission order
    pub fn errors(&self) -> Vec<Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity() == Severity::Error)
            .cloned()
            .collect()
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity() == Severity::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.diagnostics.len() - self.error_count()
    }
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Running,
    Succeeded,
    Exhausted,
    Aborted,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Aggregate root for one build request
///
/// Only the loop controller mutates a session, and only through the
/// methods below, which reject anything that would break the session
/// invariants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSession {
    pub id: SessionId,
    pub specification: ContractSpecification,
    pub attempts: Vec<BuildAttempt>,
    pub max_attempts: u32,
    pub status: SessionStatus,
    pub program_id: Option<String>,
    pub abort_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BuildSession {
    pub fn new(specification: ContractSpecification, max_attempts: u32) -> Self {
        Self::with_id(SessionId::new(), specification, max_attempts)
    }

    pub fn with_id(id: SessionId, specification: ContractSpecification, max_attempts: u32) -> Self {
        Self {
            id,
            specification,
            attempts: Vec::new(),
            max_attempts,
            status: SessionStatus::Running,
            program_id: None,
            abort_reason: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn last_attempt(&self) -> Option<&BuildAttempt> {
        self.attempts.last()
    }

    /// Source text of the last attempt that produced any
    pub fn final_source(&self) -> Option<&str> {
        self.attempts
            .iter()
            .rev()
            .map(|a| a.source.as_str())
            .find(|s| !s.is_empty())
    }

    /// Diagnostics of the final attempt
    pub fn final_diagnostics(&self) -> &[Diagnostic] {
        self.attempts
            .last()
            .map(|a| a.diagnostics.as_slice())
            .unwrap_or(&[])
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts.len() as u32)
    }

    /// Append a finished attempt
    pub fn record_attempt(&mut self, attempt: BuildAttempt) -> Result<()> {
        self.ensure_running("record attempt")?;

        if self.attempts.len() as u32 >= self.max_attempts {
            return Err(ForgeError::InvalidTransition(format!(
                "session {} already has {} of {} attempts",
                self.id,
                self.attempts.len(),
                self.max_attempts
            )));
        }

        let expected = self.attempts.len() as u32 + 1;
        if attempt.sequence != expected {
            return Err(ForgeError::InvalidTransition(format!(
                "attempt sequence {} recorded where {} was expected",
                attempt.sequence, expected
            )));
        }

        self.attempts.push(attempt);
        Ok(())
    }

    /// Mark the session succeeded with the extracted program identity
    pub fn succeed(&mut self, program_id: impl Into<String>) -> Result<()> {
        self.ensure_running("succeed")?;

        let program_id = program_id.into();
        if program_id.trim().is_empty() {
            return Err(ForgeError::InvalidTransition(
                "cannot succeed without a program identity".to_string(),
            ));
        }

        match self.attempts.last() {
            Some(last) if last.outcome == AttemptOutcome::Succeeded => {}
            _ => {
                return Err(ForgeError::InvalidTransition(
                    "cannot succeed unless the last attempt succeeded".to_string(),
                ))
            }
        }

        self.program_id = Some(program_id);
        self.finish(SessionStatus::Succeeded);
        Ok(())
    }

    /// Mark the session exhausted after its whole budget failed
    pub fn exhaust(&mut self) -> Result<()> {
        self.ensure_running("exhaust")?;

        if (self.attempts.len() as u32) != self.max_attempts {
            return Err(ForgeError::InvalidTransition(format!(
                "cannot exhaust after {} of {} attempts",
                self.attempts.len(),
                self.max_attempts
            )));
        }
        if self
            .attempts
            .iter()
            .any(|a| a.outcome == AttemptOutcome::Succeeded)
        {
            return Err(ForgeError::InvalidTransition(
                "cannot exhaust a session with a succeeded attempt".to_string(),
            ));
        }

        self.finish(SessionStatus::Exhausted);
        Ok(())
    }

    /// Abort the session because of an environment failure or cancellation
    pub fn abort(&mut self, reason: impl Into<String>) -> Result<()> {
        self.ensure_running("abort")?;
        self.abort_reason = Some(reason.into());
        self.finish(SessionStatus::Aborted);
        Ok(())
    }

    fn ensure_running(&self, op: &str) -> Result<()> {
        if self.status.is_terminal() {
            return Err(ForgeError::InvalidTransition(format!(
                "cannot {} on session {} in terminal status {}",
                op, self.id, self.status
            )));
        }
        Ok(())
    }

    fn finish(&mut self, status: SessionStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(sequence: u32, outcome: AttemptOutcome) -> BuildAttempt {
        let now = Utc::now();
        BuildAttempt {
            sequence,
            mode: if sequence == 1 {
                GenerationMode::Generate
            } else {
                GenerationMode::Repair
            },
            source: format!("// attempt {}", sequence),
            raw_output: String::new(),
            exit_code: Some(0),
            diagnostics: Vec::new(),
            outcome,
            tool_error: None,
            started_at: now,
            finished_at: now,
        }
    }

    fn spec() -> ContractSpecification {
        ContractSpecification::new(ContractKind::Escrow, "Test Escrow")
    }

    #[test]
    fn test_contract_kind_from_str() {
        assert_eq!("escrow".parse::<ContractKind>().unwrap(), ContractKind::Escrow);
        assert_eq!(
            "vesting".parse::<ContractKind>().unwrap(),
            ContractKind::TokenVesting
        );
        assert_eq!(
            "Token-Vesting".parse::<ContractKind>().unwrap(),
            ContractKind::TokenVesting
        );
        assert!("lottery".parse::<ContractKind>().is_err());
    }

    #[test]
    fn test_program_name() {
        assert_eq!(spec().program_name(), "test_escrow");
        assert_eq!(
            ContractSpecification::new(ContractKind::Custom, "MyVault v2").program_name(),
            "my_vault_v2"
        );
        assert_eq!(
            ContractSpecification::new(ContractKind::Crowdfunding, "  !! ").program_name(),
            "crowdfunding"
        );
        assert_eq!(
            ContractSpecification::new(ContractKind::Custom, "3 pools").program_name(),
            "_3_pools"
        );
    }

    #[test]
    fn test_session_id_roundtrip() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<SessionId>().is_err());
    }

    #[test]
    fn test_record_attempt_enforces_budget() {
        let mut session = BuildSession::new(spec(), 1);
        session
            .record_attempt(attempt(1, AttemptOutcome::Failed))
            .unwrap();
        assert!(session
            .record_attempt(attempt(2, AttemptOutcome::Failed))
            .is_err());
        assert_eq!(session.attempts.len(), 1);
    }

    #[test]
    fn test_record_attempt_enforces_sequence() {
        let mut session = BuildSession::new(spec(), 3);
        assert!(session
            .record_attempt(attempt(2, AttemptOutcome::Failed))
            .is_err());
    }

    #[test]
    fn test_succeed_requires_identity_and_succeeded_attempt() {
        let mut session = BuildSession::new(spec(), 3);
        session
            .record_attempt(attempt(1, AttemptOutcome::Failed))
            .unwrap();
        assert!(session.succeed("Prog1111").is_err());

        session
            .record_attempt(attempt(2, AttemptOutcome::Succeeded))
            .unwrap();
        assert!(session.succeed("  ").is_err());
        session.succeed("Prog1111").unwrap();

        assert_eq!(session.status, SessionStatus::Succeeded);
        assert_eq!(session.program_id.as_deref(), Some("Prog1111"));
        assert!(session.finished_at.is_some());
    }

    #[test]
    fn test_exhaust_requires_full_budget() {
        let mut session = BuildSession::new(spec(), 2);
        session
            .record_attempt(attempt(1, AttemptOutcome::Failed))
            .unwrap();
        assert!(session.exhaust().is_err());

        session
            .record_attempt(attempt(2, AttemptOutcome::ToolError))
            .unwrap();
        session.exhaust().unwrap();
        assert_eq!(session.status, SessionStatus::Exhausted);
        assert!(session.program_id.is_none());
    }

    #[test]
    fn test_terminal_session_rejects_mutation() {
        let mut session = BuildSession::new(spec(), 2);
        session.abort("toolchain missing").unwrap();

        assert!(session.abort("again").is_err());
        assert!(session
            .record_attempt(attempt(1, AttemptOutcome::Failed))
            .is_err());
        assert_eq!(session.abort_reason.as_deref(), Some("toolchain missing"));
    }

    #[test]
    fn test_final_source_skips_empty_attempts() {
        let mut session = BuildSession::new(spec(), 3);
        session
            .record_attempt(attempt(1, AttemptOutcome::Failed))
            .unwrap();
        let mut second = attempt(2, AttemptOutcome::ToolError);
        second.source.clear();
        session.record_attempt(second).unwrap();

        assert_eq!(session.final_source(), Some("// attempt 1"));
        assert_eq!(session.remaining_attempts(), 1);
    }
}
