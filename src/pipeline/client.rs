//! Extraction client: send page images to the vision provider.
//!
//! [`ExtractionBackend`] is the seam between the task runner and the outside
//! world; tests substitute a scripted fake, production wires in
//! [`GeminiClient`]. The client is intentionally thin: it builds one
//! multimodal request (instruction text first, then every page image in
//! sequence order, each tagged with its MIME type), asks the provider to
//! constrain its answer to a single JSON-text payload, and hands back the raw
//! text plus the reported token counters. It never parses or validates the
//! payload itself; parsing it is the consumer's job at query time, and it never
//! retries: a failed extraction is recorded as a failed task.

use crate::config::ServiceConfig;
use crate::error::ExtractError;
use crate::pipeline::render::PageImage;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Token-usage counters as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

impl TokenUsage {
    /// Reject counters that are negative or do not add up.
    ///
    /// Catching this here means no task record can ever hold inconsistent
    /// usage numbers.
    pub fn validate(&self) -> Result<(), ExtractError> {
        let consistent = self.prompt_tokens >= 0
            && self.completion_tokens >= 0
            && self.total_tokens == self.prompt_tokens + self.completion_tokens;
        if consistent {
            Ok(())
        } else {
            Err(ExtractError::MalformedUsage {
                prompt: self.prompt_tokens,
                completion: self.completion_tokens,
                total: self.total_tokens,
            })
        }
    }
}

/// A successful extraction: the provider's raw text payload plus usage.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Raw response text, expected to be JSON but stored opaquely.
    pub payload: String,
    pub usage: TokenUsage,
}

/// Boundary to the external multimodal extraction service.
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    /// Run one extraction over an ordered page sequence.
    async fn extract(
        &self,
        instruction: &str,
        pages: &[PageImage],
    ) -> Result<Extraction, ExtractError>;
}

// ── Gemini wire types ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

/// One part of a multimodal content block: either text or inline image data.
#[derive(Debug, Serialize)]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "inlineData", skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Serialize)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    /// Base64-encoded image bytes.
    data: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(rename = "responseMimeType")]
    response_mime_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: i64,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: i64,
    #[serde(rename = "totalTokenCount", default)]
    total_token_count: i64,
}

/// Build the multimodal request body: instruction first, then every page in
/// sequence order. Kept free of I/O so tests can assert the exact layout.
fn build_request(instruction: &str, pages: &[PageImage]) -> GenerateContentRequest {
    let mut parts = Vec::with_capacity(pages.len() + 1);
    parts.push(Part {
        text: Some(instruction.to_string()),
        inline_data: None,
    });
    for page in pages {
        parts.push(Part {
            text: None,
            inline_data: Some(InlineData {
                mime_type: page.mime.to_string(),
                data: STANDARD.encode(&page.bytes),
            }),
        });
    }
    GenerateContentRequest {
        contents: vec![Content { parts }],
        generation_config: GenerationConfig {
            response_mime_type: "application/json",
        },
    }
}

// ── Gemini client ─────────────────────────────────────────────────────────

/// Client for Google's `generateContent` REST API.
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    /// Build a client from the service configuration.
    pub fn new(config: &ServiceConfig) -> Result<Self, ExtractError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ExtractError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

#[async_trait]
impl ExtractionBackend for GeminiClient {
    async fn extract(
        &self,
        instruction: &str,
        pages: &[PageImage],
    ) -> Result<Extraction, ExtractError> {
        let body = build_request(instruction, pages);
        debug!(
            model = %self.model,
            pages = pages.len(),
            "Sending extraction request"
        );

        let response = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExtractError::Unreachable {
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = truncate(&response.text().await.unwrap_or_default(), 300);
            warn!(%status, "Extraction request rejected");
            return Err(match status.as_u16() {
                401 | 403 => ExtractError::AuthFailed {
                    status: status.as_u16(),
                    detail,
                },
                code => ExtractError::ApiRejected {
                    status: code,
                    detail,
                },
            });
        }

        let parsed: GenerateContentResponse =
            response
                .json()
                .await
                .map_err(|e| ExtractError::ApiRejected {
                    status: status.as_u16(),
                    detail: format!("undecodable response body: {e}"),
                })?;

        into_extraction(parsed)
    }
}

/// Convert a decoded provider response into an [`Extraction`], enforcing the
/// usage-counter invariant.
fn into_extraction(response: GenerateContentResponse) -> Result<Extraction, ExtractError> {
    let payload: String = response
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect()
        })
        .unwrap_or_default();

    if payload.is_empty() {
        return Err(ExtractError::EmptyResponse);
    }

    // Absent metadata is reported as -1 so the mismatch message is explicit
    // about what the provider actually sent.
    let usage = match response.usage_metadata {
        Some(meta) => TokenUsage {
            prompt_tokens: meta.prompt_token_count,
            completion_tokens: meta.candidates_token_count,
            total_tokens: meta.total_token_count,
        },
        None => TokenUsage {
            prompt_tokens: -1,
            completion_tokens: -1,
            total_tokens: -1,
        },
    };
    usage.validate()?;

    debug!(
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        "Extraction succeeded"
    );
    Ok(Extraction { payload, usage })
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(bytes: &[u8], mime: &'static str) -> PageImage {
        PageImage {
            bytes: bytes.to_vec(),
            mime,
        }
    }

    #[test]
    fn request_puts_instruction_first_then_pages_in_order() {
        let pages = vec![
            page(b"page-one", "image/png"),
            page(b"page-two", "image/png"),
            page(b"page-three", "image/jpeg"),
        ];
        let body = build_request("extract the invoice", &pages);
        let json = serde_json::to_value(&body).expect("serialises");

        let parts = json["contents"][0]["parts"]
            .as_array()
            .expect("parts array");
        assert_eq!(parts.len(), 4, "instruction + 3 pages");
        assert_eq!(parts[0]["text"], "extract the invoice");
        assert_eq!(
            parts[1]["inlineData"]["data"],
            STANDARD.encode(b"page-one")
        );
        assert_eq!(
            parts[2]["inlineData"]["data"],
            STANDARD.encode(b"page-two")
        );
        assert_eq!(parts[3]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(
            json["generationConfig"]["responseMimeType"],
            "application/json"
        );
    }

    #[test]
    fn usage_validation_accepts_consistent_counters() {
        let usage = TokenUsage {
            prompt_tokens: 120,
            completion_tokens: 30,
            total_tokens: 150,
        };
        usage.validate().expect("consistent usage");
    }

    #[test]
    fn usage_validation_rejects_mismatched_total() {
        let usage = TokenUsage {
            prompt_tokens: 120,
            completion_tokens: 30,
            total_tokens: 9000,
        };
        let err = usage.validate().expect_err("mismatch must fail");
        assert!(matches!(err, ExtractError::MalformedUsage { .. }));
    }

    #[test]
    fn usage_validation_rejects_negative_counters() {
        let usage = TokenUsage {
            prompt_tokens: -1,
            completion_tokens: 1,
            total_tokens: 0,
        };
        assert!(usage.validate().is_err());
    }

    #[test]
    fn response_parsing_extracts_payload_and_usage() {
        let raw = serde_json::json!({
            "candidates": [
                {"content": {"parts": [{"text": "{\"invoice_number\":\"F-001\"}"}]}}
            ],
            "usageMetadata": {
                "promptTokenCount": 500,
                "candidatesTokenCount": 40,
                "totalTokenCount": 540
            }
        });
        let parsed: GenerateContentResponse =
            serde_json::from_value(raw).expect("decodes");
        let extraction = into_extraction(parsed).expect("valid extraction");
        assert_eq!(extraction.payload, "{\"invoice_number\":\"F-001\"}");
        assert_eq!(extraction.usage.total_tokens, 540);
    }

    #[test]
    fn response_without_candidates_is_empty_response() {
        let parsed: GenerateContentResponse =
            serde_json::from_value(serde_json::json!({})).expect("decodes");
        let err = into_extraction(parsed).expect_err("no candidates must fail");
        assert!(matches!(err, ExtractError::EmptyResponse));
    }

    #[test]
    fn response_without_usage_is_malformed() {
        let raw = serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "{}"}]}}]
        });
        let parsed: GenerateContentResponse =
            serde_json::from_value(raw).expect("decodes");
        let err = into_extraction(parsed).expect_err("missing usage must fail");
        assert!(matches!(err, ExtractError::MalformedUsage { .. }));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "héllo wörld";
        let t = truncate(s, 3);
        assert!(t.starts_with("hé") || t.starts_with('h'));
        assert!(t.ends_with('…'));
        assert_eq!(truncate("short", 300), "short");
    }
}
