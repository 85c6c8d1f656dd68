//! Prompt construction for generation and repair calls
//!
//! Each call is self-contained: the repair prompt carries the full prior
//! source and every error from its build, never a conversation history.

use scforge_core::diagnostics::render_diagnostics;
use scforge_core::{ContractSpecification, Diagnostic, PLACEHOLDER_PROGRAM_ID};

pub const SYSTEM_PROMPT: &str = "You write Solana programs with the Anchor framework. \
You answer with a single complete `lib.rs` in one ```rust fenced block and nothing else.";

fn render_specification(spec: &ContractSpecification) -> String {
    serde_json::to_string_pretty(spec).unwrap_or_else(|_| format!("{} \"{}\"", spec.kind, spec.name))
}

/// Prompt for a fresh program
pub fn generation_prompt(spec: &ContractSpecification) -> String {
    format!(
        r#"Create a complete Solana smart contract using the Anchor framework.

CONTRACT KIND: {kind}
PROGRAM MODULE NAME: {module}

CONTRACT DETAILS:
{details}

REQUIREMENTS:
- Use `declare_id!("{placeholder}");` as the program id.
- Name the `#[program]` module `{module}`.
- Include account validation and custom error codes.
- Everything must live in a single `lib.rs` that compiles with `anchor build`.
- Return only Rust code.
"#,
        kind = spec.kind,
        module = spec.program_name(),
        details = render_specification(spec),
        placeholder = PLACEHOLDER_PROGRAM_ID,
    )
}

/// Prompt for fixing a program that failed to compile
pub fn repair_prompt(
    spec: &ContractSpecification,
    prior_source: &str,
    diagnostics: &[Diagnostic],
) -> String {
    format!(
        r#"The following Anchor program failed to compile. Fix every error below.

CONTRACT DETAILS:
{details}

CURRENT SOURCE (programs/{module}/src/lib.rs):
```rust
{source}
```

COMPILER ERRORS ({count}):
{errors}

REQUIREMENTS:
- Keep `declare_id!("{placeholder}");` and the module name `{module}`.
- Preserve working functionality while fixing the errors.
- Return the complete corrected file, only Rust code.
"#,
        details = render_specification(spec),
        module = spec.program_name(),
        source = prior_source.trim_end(),
        count = diagnostics.len(),
        errors = render_diagnostics(diagnostics),
        placeholder = PLACEHOLDER_PROGRAM_ID,
    )
}
