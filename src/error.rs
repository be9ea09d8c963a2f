//! Error types for the docuvision library.
//!
//! A single [`ExtractError`] enum covers the whole failure taxonomy:
//!
//! * **Input errors**: the submitted document is malformed, oversized, or of
//!   an unsupported kind. Surfaced synchronously at submission or recorded as
//!   a FAILED task when discovered during rendering.
//! * **Extraction errors**: the external provider is unreachable, rejects the
//!   request, or reports inconsistent usage metadata.
//! * **Store errors**: the SQLite task store misbehaved, or a record vanished
//!   between creation and processing.
//!
//! The task runner converts every variant into a FAILED terminal state via
//! [`std::fmt::Display`], so each message must stand on its own when it comes
//! back from a status poll.

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// All errors returned by the docuvision library.
#[derive(Debug, Error)]
pub enum ExtractError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The file extension maps to no supported source kind.
    #[error("Unsupported document kind for '{filename}' (supported: pdf, jpg, jpeg, png)")]
    UnsupportedKind { filename: String },

    /// The submitted file exceeds the configured size cap.
    #[error("File '{filename}' is {size_mb} MB, exceeding the {limit_mb} MB limit")]
    FileTooLarge {
        filename: String,
        size_mb: u64,
        limit_mb: u64,
    },

    /// The submitted file contains no bytes at all.
    #[error("File '{filename}' is empty")]
    EmptyFile { filename: String },

    // ── Render errors ─────────────────────────────────────────────────────
    /// The document could not be parsed as its declared format.
    #[error("Document cannot be parsed as {kind}: {detail}")]
    CorruptDocument { kind: &'static str, detail: String },

    /// Parsing succeeded but rendering produced zero page images.
    ///
    /// A blank document and a failed conversion are deliberately collapsed
    /// into this one variant: the provider cannot extract anything from zero
    /// images either way.
    #[error("Document rendered to zero page images")]
    EmptyDocument,

    /// pdfium failed on a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    PageRenderFailed { page: usize, detail: String },

    /// A rendered page could not be PNG-encoded.
    #[error("PNG encoding failed for page {page}: {detail}")]
    PageEncodeFailed { page: usize, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
         Place libpdfium next to the executable or install it system-wide\n\
         (override the lookup with PDFIUM_LIB_PATH)."
    )]
    PdfiumBinding(String),

    // ── Extraction errors ─────────────────────────────────────────────────
    /// Transport-level failure talking to the extraction provider.
    #[error("Extraction service unreachable: {reason}")]
    Unreachable { reason: String },

    /// The provider rejected the request with an authentication error (401/403).
    #[error("Extraction service authentication failed (HTTP {status}): check API credentials ({detail})")]
    AuthFailed { status: u16, detail: String },

    /// The provider rejected the request with a non-auth, non-success status.
    #[error("Extraction service rejected the request (HTTP {status}): {detail}")]
    ApiRejected { status: u16, detail: String },

    /// The provider answered 200 but with no usable candidate text.
    #[error("Extraction service returned an empty response")]
    EmptyResponse,

    /// Reported token counters are negative or do not add up.
    #[error(
        "Extraction service reported inconsistent usage: \
         prompt={prompt} completion={completion} total={total}"
    )]
    MalformedUsage {
        prompt: i64,
        completion: i64,
        total: i64,
    },

    /// The instruction template file could not be read.
    #[error("Failed to read instruction template {path:?}: {source}")]
    InstructionUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Store errors ──────────────────────────────────────────────────────
    /// Underlying SQLite failure.
    #[error("Task store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// No record exists for the given task id.
    #[error("Task {task_id} not found")]
    TaskNotFound { task_id: Uuid },

    /// The record exists but is not in the status the transition requires.
    ///
    /// Status transitions are monotonic; this fires when a caller attempts to
    /// revisit or skip a state.
    #[error("Task {task_id} is not in status {expected}; transition rejected")]
    InvalidTransition {
        task_id: Uuid,
        expected: &'static str,
    },

    /// A blocking store task failed to join.
    #[error("Store task join error: {0}")]
    Join(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failed_mentions_credentials() {
        let e = ExtractError::AuthFailed {
            status: 403,
            detail: "API key invalid".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("authentication"), "got: {msg}");
        assert!(msg.contains("credentials"), "got: {msg}");
        assert!(msg.contains("403"), "got: {msg}");
    }

    #[test]
    fn file_too_large_display() {
        let e = ExtractError::FileTooLarge {
            filename: "scan.pdf".into(),
            size_mb: 42,
            limit_mb: 10,
        };
        let msg = e.to_string();
        assert!(msg.contains("scan.pdf"));
        assert!(msg.contains("42"));
        assert!(msg.contains("10"));
    }

    #[test]
    fn malformed_usage_display() {
        let e = ExtractError::MalformedUsage {
            prompt: 100,
            completion: 50,
            total: 9000,
        };
        let msg = e.to_string();
        assert!(msg.contains("prompt=100"));
        assert!(msg.contains("total=9000"));
    }

    #[test]
    fn invalid_transition_display() {
        let id = Uuid::new_v4();
        let e = ExtractError::InvalidTransition {
            task_id: id,
            expected: "PROCESSING",
        };
        let msg = e.to_string();
        assert!(msg.contains(&id.to_string()));
        assert!(msg.contains("PROCESSING"));
    }
}
