//! Pipeline stages executed by the task runner.
//!
//! Each submodule implements exactly one transformation step, keeping stages
//! independently testable and swappable.
//!
//! ## Data Flow
//!
//! ```text
//! render ───────▶ client ───────▶ (task store)
//! (pdfium/passthrough)  (Gemini generateContent)
//! ```
//!
//! 1. [`render`]: document bytes → ordered page images; runs in
//!    `spawn_blocking` for PDFs because pdfium is not async-safe
//! 2. [`client`]: one multimodal request per task; the only stage with
//!    network I/O

pub mod client;
pub mod render;
