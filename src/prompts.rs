//! Instruction templates for vision-model document extraction.
//!
//! The instruction is a versionable artifact, not code: operators tune field
//! lists and output schemas far more often than they redeploy. When
//! [`crate::config::ServiceConfig::instruction_path`] is set, the template file
//! is re-read on **every** extraction call, so edits take effect for the next
//! task without a restart. The built-in default below is used only when no
//! path is configured.

use crate::error::ExtractError;
use std::path::Path;

/// Default extraction instruction, used when no template file is configured.
///
/// Asks for a single JSON object so the response pairs with the
/// JSON-constrained generation config the client sends.
pub const DEFAULT_INSTRUCTION: &str = r#"You are an expert document data extractor. You receive one or more page images of a single business document (an invoice, receipt, or similar) and must extract its structured data.

Follow these rules precisely:

1. SCOPE
   - Read every page image in order; they belong to one document
   - Extract issuer, recipient, dates, line items, amounts, totals, taxes,
     currency, and any document identifiers you can see

2. ACCURACY
   - Copy values exactly as printed; do not normalise or convert
   - Use null for fields that are absent or unreadable
   - Never invent values that are not visible on the page

3. OUTPUT FORMAT
   - Output ONLY a single JSON object
   - Do NOT wrap it in markdown fences
   - Do NOT add commentary or explanations"#;

/// Load the instruction text for one extraction call.
///
/// Reads `path` fresh when provided; falls back to [`DEFAULT_INSTRUCTION`]
/// otherwise. A configured-but-unreadable template is an error rather than a
/// silent fallback, so a bad deploy fails loudly instead of extracting with
/// stale instructions.
pub async fn load_instruction(path: Option<&Path>) -> Result<String, ExtractError> {
    match path {
        Some(p) => tokio::fs::read_to_string(p)
            .await
            .map_err(|source| ExtractError::InstructionUnreadable {
                path: p.to_path_buf(),
                source,
            }),
        None => Ok(DEFAULT_INSTRUCTION.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn default_when_no_path() {
        let text = load_instruction(None).await.expect("default loads");
        assert_eq!(text, DEFAULT_INSTRUCTION);
        assert!(text.contains("JSON object"));
    }

    #[tokio::test]
    async fn reads_file_fresh_each_call() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, "extract v1").expect("write");
        file.flush().expect("flush");

        let text = load_instruction(Some(file.path())).await.expect("load v1");
        assert_eq!(text, "extract v1");

        // Rewrite in place; the next call must observe the new content.
        std::fs::write(file.path(), "extract v2").expect("rewrite");
        let text = load_instruction(Some(file.path())).await.expect("load v2");
        assert_eq!(text, "extract v2");
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let err = load_instruction(Some(Path::new("/definitely/not/here.txt")))
            .await
            .expect_err("missing template must fail");
        assert!(err.to_string().contains("instruction template"));
    }
}
