//! Pull program source out of a model response

/// Contract source from a response
///
/// Returns the body of the first fenced code block, or the whole response
/// with any stray fence markers removed. `None` when nothing is left.
pub fn extract_source(response: &str) -> Option<String> {
    let source = first_fenced_block(response).unwrap_or_else(|| strip_fences(response));
    let trimmed = source.trim();

    if trimmed.is_empty() {
        None
    } else {
        Some(format!("{}\n", trimmed))
    }
}

fn first_fenced_block(response: &str) -> Option<String> {
    let mut lines = response.lines();
    lines.find(|line| line.trim_start().starts_with("```"))?;

    let mut body = Vec::new();
    for line in lines {
        if line.trim_start().starts_with("```") {
            return Some(body.join("\n"));
        }
        body.push(line);
    }

    // Unterminated fence: take everything after the opener
    Some(body.join("\n"))
}

fn strip_fences(response: &str) -> String {
    response
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fenced_block_wins() {
        let response = "Here is the program:\n\n```rust\nuse anchor_lang::prelude::*;\n```\n\nAnd a test:\n```rust\n#[test]\nfn t() {}\n```\n";
        assert_eq!(
            extract_source(response).as_deref(),
            Some("use anchor_lang::prelude::*;\n")
        );
    }

    #[test]
    fn test_plain_text_is_source() {
        assert_eq!(
            extract_source("  fn main() {}  \n").as_deref(),
            Some("fn main() {}\n")
        );
    }

    #[test]
    fn test_unterminated_fence() {
        assert_eq!(
            extract_source("```rust\nfn a() {}\nfn b() {}").as_deref(),
            Some("fn a() {}\nfn b() {}\n")
        );
    }

    #[test]
    fn test_empty_results_are_none() {
        assert!(extract_source("").is_none());
        assert!(extract_source("   \n").is_none());
        assert!(extract_source("```rust\n```").is_none());
    }
}
