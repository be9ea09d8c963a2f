//! # docuvision
//!
//! Asynchronous document-extraction service: PDFs and scanned images go in,
//! structured text extracted by a multimodal model comes out, tracked as
//! durable tasks that callers poll by id.
//!
//! ## Pipeline
//!
//! ```text
//! submit(files)            poll(task_id)
//!      │                        ▲
//!      ▼                        │
//! ┌──────────┐   ┌─────────────────────────┐
//! │ validate │──▶│ task store (SQLite)     │
//! └──────────┘   │ PENDING → PROCESSING →  │
//!      │         │ {COMPLETED, FAILED}     │
//!      ▼         └─────────────────────────┘
//! ┌──────────┐   ┌──────────┐   ┌──────────────────┐
//! │ render   │──▶│ encode   │──▶│ extraction model │
//! │ (pdfium) │   │ (base64) │   │ (Gemini vision)  │
//! └──────────┘   └──────────┘   └──────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use docuvision::{ExtractionService, ServiceConfig, SubmittedDocument};
//!
//! # async fn run() -> Result<(), docuvision::ExtractError> {
//! let config = ServiceConfig::builder()
//!     .api_key("your-api-key")
//!     .db_path("tasks.sqlite")
//!     .build()?;
//! let service = ExtractionService::open(config).await?;
//!
//! let ids = service
//!     .submit(
//!         "billing",
//!         vec![SubmittedDocument {
//!             filename: "invoice.pdf".into(),
//!             bytes: std::fs::read("invoice.pdf").map_err(|e| {
//!                 docuvision::ExtractError::Internal(e.to_string())
//!             })?,
//!         }],
//!     )
//!     .await?;
//!
//! let report = service.status(ids[0]).await?;
//! println!("{}", serde_json::to_string_pretty(&report).unwrap());
//! # Ok(())
//! # }
//! ```
//!
//! Rendering PDFs needs a pdfium shared library at runtime; set
//! `PDFIUM_LIB_PATH` or install it system-wide. Plain JPEG/PNG submissions
//! work without it.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod prompts;
pub mod runner;
pub mod service;
pub mod store;

pub use config::{ServiceConfig, ServiceConfigBuilder, DEFAULT_API_BASE_URL, DEFAULT_MODEL};
pub use error::ExtractError;
pub use pipeline::client::{Extraction, ExtractionBackend, GeminiClient, TokenUsage};
pub use pipeline::render::{PageImage, SourceKind};
pub use prompts::{load_instruction, DEFAULT_INSTRUCTION};
pub use runner::TaskRunner;
pub use service::{ExtractionService, StatusReport, SubmittedDocument};
pub use store::{StoreStats, TaskRecord, TaskStatus, TaskStore};
