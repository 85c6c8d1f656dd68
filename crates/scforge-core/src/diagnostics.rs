//! Diagnostic parsing for toolchain output
//!
//! Turns the raw text printed by `anchor build` / `cargo build-sbf` into
//! structured [`Diagnostic`] records. The parser is a pure function and is
//! tolerant of format drift: lines it does not recognise are kept verbatim
//! in a single catch-all diagnostic rather than dropped.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// `error[E0425]: msg`, `warning: msg`, or anchor's `Error: msg`
static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<sev>error|warning|Error)(?:\[(?P<code>[A-Za-z0-9_:-]+)\])?:\s*(?P<msg>.*\S)\s*$")
        .expect("HEADER_RE regex should compile")
});

/// ` --> programs/escrow/src/lib.rs:12:5`
static LOCATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*-->\s*(?P<file>.+?):(?P<line>\d+)(?::(?P<col>\d+))?\s*$")
        .expect("LOCATION_RE regex should compile")
});

/// Cargo progress lines carry no diagnostic information.
static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:Compiling|Checking|Finished|Running|Updating|Downloading|Downloaded|Locking|Adding|Fresh|Blocking|Building|Documenting|Packaging|Installing|Installed|Replacing|Removing|Fetching|Unpacking)\s",
    )
    .expect("PROGRESS_RE regex should compile")
});

/// Summary lines restate diagnostics that were already emitted.
static SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?:error|warning): (?:could not compile|aborting due to|build failed, waiting|`[^`]+` \([^)]*\) generated \d+ warnings?|\d+ warnings? emitted)|For more information about)",
    )
    .expect("SUMMARY_RE regex should compile")
});

/// Diagnostic severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// Where the toolchain says a problem is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.column {
            Some(col) => write!(f, "{}:{}:{}", self.file, self.line, col),
            None => write!(f, "{}:{}", self.file, self.line),
        }
    }
}

/// One toolchain-reported problem
///
/// Produced by [`parse`]. The only other constructor is
/// [`Diagnostic::synthetic`], for failures the loop controller detects
/// itself (zero exit without a usable artifact, non-zero exit without any
/// parsed error).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    severity: Severity,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    location: Option<SourceLocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    notes: Vec<String>,
}

impl Diagnostic {
    fn header(severity: Severity, code: Option<String>, message: String) -> Self {
        Self {
            severity,
            message,
            code,
            location: None,
            notes: Vec::new(),
        }
    }

    /// Error-severity diagnostic raised by the loop controller
    pub fn synthetic(message: impl Into<String>) -> Self {
        Self::header(Severity::Error, None, message.into())
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn location(&self) -> Option<&SourceLocation> {
        self.location.as_ref()
    }

    /// Context lines printed under the header (snippets, notes, help)
    pub fn notes(&self) -> &[String] {
        &self.notes
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}[{}]: {}", self.severity, code, self.message)?,
            None => write!(f, "{}: {}", self.severity, self.message)?,
        }
        if let Some(loc) = &self.location {
            write!(f, " ({})", loc)?;
        }
        Ok(())
    }
}

/// Parse raw toolchain output into diagnostics, in emission order
///
/// Unrecognised lines are collected into one trailing warning-severity
/// diagnostic without a location.
pub fn parse(raw: &str) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let mut current: Option<Diagnostic> = None;
    let mut unrecognized: Vec<&str> = Vec::new();

    for line in raw.lines() {
        let trimmed_end = line.trim_end();

        if trimmed_end.trim().is_empty() {
            diagnostics.extend(current.take());
            continue;
        }

        if PROGRESS_RE.is_match(trimmed_end) {
            diagnostics.extend(current.take());
            continue;
        }

        if let Some(caps) = LOCATION_RE.captures(trimmed_end) {
            if let Some(diag) = current.as_mut() {
                if diag.location.is_none() {
                    diag.location = Some(SourceLocation {
                        file: caps["file"].to_string(),
                        line: caps["line"].parse().unwrap_or(0),
                        column: caps.name("col").and_then(|c| c.as_str().parse().ok()),
                    });
                } else {
                    diag.notes.push(trimmed_end.to_string());
                }
                continue;
            }
        }

        if SUMMARY_RE.is_match(trimmed_end) {
            diagnostics.extend(current.take());
            continue;
        }

        if let Some(caps) = HEADER_RE.captures(trimmed_end) {
            diagnostics.extend(current.take());
            let severity = match &caps["sev"] {
                "warning" => Severity::Warning,
                _ => Severity::Error,
            };
            current = Some(Diagnostic::header(
                severity,
                caps.name("code").map(|c| c.as_str().to_string()),
                caps["msg"].to_string(),
            ));
            continue;
        }

        if let Some(diag) = current.as_mut() {
            if is_continuation(trimmed_end) {
                diag.notes.push(trimmed_end.to_string());
                continue;
            }
            diagnostics.extend(current.take());
        }

        unrecognized.push(trimmed_end);
    }

    diagnostics.extend(current.take());

    if !unrecognized.is_empty() {
        diagnostics.push(Diagnostic::header(
            Severity::Warning,
            None,
            unrecognized.join("\n"),
        ));
    }

    diagnostics
}

fn is_continuation(line: &str) -> bool {
    let after_gutter = line.trim_start_matches(|c: char| c.is_ascii_digit());
    let numbered_snippet = after_gutter.len() < line.len() && after_gutter.trim_start().starts_with('|');

    numbered_snippet
        || line.starts_with(char::is_whitespace)
        || line.starts_with('|')
        || line.starts_with('=')
        || line.starts_with("help:")
        || line.starts_with("note:")
        || line.starts_with("...")
}

/// Error-severity diagnostics, in emission order
pub fn errors(diagnostics: &[Diagnostic]) -> Vec<Diagnostic> {
    diagnostics.iter().filter(|d| d.is_error()).cloned().collect()
}

/// Plain-text rendering used in repair prompts and CLI output
pub fn render_diagnostics(diagnostics: &[Diagnostic]) -> String {
    let mut out = String::new();

    for diag in diagnostics {
        out.push_str(&diag.to_string());
        out.push('\n');
        for note in &diag.notes {
            out.push_str("    ");
            out.push_str(note);
            out.push('\n');
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"   Compiling escrow v0.1.0 (/tmp/ws/programs/escrow)
error[E0425]: cannot find value `vault` in this scope
  --> programs/escrow/src/lib.rs:42:9
   |
42 |         vault.amount = amount;
   |         ^^^^^ not found in this scope

warning: unused variable: `bump`
  --> programs/escrow/src/lib.rs:17:13
   |
17 |         let bump = ctx.bumps.escrow;
   |             ^^^^ help: if this is intentional, prefix it with an underscore: `_bump`
   |
   = note: `#[warn(unused_variables)]` on by default

error[E0308]: mismatched types
  --> programs/escrow/src/lib.rs:58:20
   |
58 |         Ok(amount)
   |            ^^^^^^ expected `()`, found `u64`

warning: `escrow` (lib) generated 1 warning
error: could not compile `escrow` (lib) due to 2 previous errors; 1 warning emitted
"#;

    #[test]
    fn test_parse_fixture_counts_and_order() {
        let diags = parse(FIXTURE);
        let errs = errors(&diags);
        let warns: Vec<_> = diags
            .iter()
            .filter(|d| d.severity() == Severity::Warning)
            .collect();

        assert_eq!(errs.len(), 2);
        assert_eq!(warns.len(), 1);
        assert_eq!(diags.len(), 3);

        assert_eq!(errs[0].code(), Some("E0425"));
        assert_eq!(errs[1].code(), Some("E0308"));
        assert!(diags[1].message().starts_with("unused variable"));
    }

    #[test]
    fn test_parse_locations() {
        let diags = parse(FIXTURE);
        let loc = diags[0].location().unwrap();
        assert_eq!(loc.file, "programs/escrow/src/lib.rs");
        assert_eq!(loc.line, 42);
        assert_eq!(loc.column, Some(9));
        assert_eq!(loc.to_string(), "programs/escrow/src/lib.rs:42:9");
    }

    #[test]
    fn test_parse_keeps_context_as_notes() {
        let diags = parse(FIXTURE);
        assert!(diags[0]
            .notes()
            .iter()
            .any(|n| n.contains("vault.amount = amount;")));
        assert!(diags[1]
            .notes()
            .iter()
            .any(|n| n.contains("#[warn(unused_variables)]")));
    }

    #[test]
    fn test_unrecognized_lines_become_catch_all() {
        let raw = "BPF SDK: /home/user/.local/share/solana\nsomething exploded in an unknown way\n";
        let diags = parse(raw);

        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].severity(), Severity::Warning);
        assert!(diags[0].location().is_none());
        assert_eq!(
            diags[0].message(),
            "BPF SDK: /home/user/.local/share/solana\nsomething exploded in an unknown way"
        );
    }

    #[test]
    fn test_catch_all_follows_structured_diagnostics() {
        let raw = "thread 'main' panicked at build.rs\nerror: linker `cc` not found\n";
        let diags = parse(raw);

        assert_eq!(diags.len(), 2);
        assert!(diags[0].is_error());
        assert_eq!(diags[0].message(), "linker `cc` not found");
        assert_eq!(diags[1].message(), "thread 'main' panicked at build.rs");
    }

    #[test]
    fn test_anchor_style_error() {
        let diags = parse("Error: Building IDL failed. Run `ANCHOR_LOG=true anchor idl build` to see the logs.\n");
        assert_eq!(diags.len(), 1);
        assert!(diags[0].is_error());
        assert!(diags[0].message().starts_with("Building IDL failed"));
    }

    #[test]
    fn test_clean_output_has_no_diagnostics() {
        let raw = "   Compiling escrow v0.1.0\n    Finished `release` profile [optimized] target(s) in 4.12s\n";
        assert!(parse(raw).is_empty());
        assert!(parse("").is_empty());
    }

    #[test]
    fn test_synthetic_is_error_without_location() {
        let diag = Diagnostic::synthetic("program identity unavailable");
        assert!(diag.is_error());
        assert!(diag.location().is_none());
        assert_eq!(diag.to_string(), "error: program identity unavailable");
    }

    #[test]
    fn test_render_diagnostics() {
        let diags = parse(FIXTURE);
        let rendered = render_diagnostics(&errors(&diags));
        assert!(rendered.contains(
            "error[E0425]: cannot find value `vault` in this scope (programs/escrow/src/lib.rs:42:9)"
        ));
        assert!(rendered.contains("error[E0308]: mismatched types"));
        assert!(!rendered.contains("unused variable"));
    }

    #[test]
    fn test_serde_roundtrip_preserves_fields() {
        let diags = parse(FIXTURE);
        let json = serde_json::to_string(&diags).unwrap();
        let back: Vec<Diagnostic> = serde_json::from_str(&json).unwrap();
        assert_eq!(diags, back);
    }
}
