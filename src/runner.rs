//! Per-task worker: drives one submitted document from PENDING to a
//! terminal state.
//!
//! The runner owns the "exactly two store writes" contract: one
//! `mark_processing` before any external work, then exactly one terminal
//! write (`complete` or `fail`). Everything between those writes is wrapped
//! in a panic guard so a crashing pipeline stage still lands the record in
//! FAILED instead of leaving it stuck in PROCESSING.

use crate::error::ExtractError;
use crate::pipeline::client::{ExtractionBackend, TokenUsage};
use crate::pipeline::render::{self, SourceKind};
use crate::prompts;
use crate::store::TaskStore;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Drives submitted documents through render → extract → persist.
/// Cheap to clone; clones share the store and backend.
#[derive(Clone)]
pub struct TaskRunner {
    store: TaskStore,
    backend: Arc<dyn ExtractionBackend>,
    instruction_path: Option<PathBuf>,
    render_scale: f32,
}

impl TaskRunner {
    pub fn new(
        store: TaskStore,
        backend: Arc<dyn ExtractionBackend>,
        instruction_path: Option<PathBuf>,
        render_scale: f32,
    ) -> Self {
        Self {
            store,
            backend,
            instruction_path,
            render_scale,
        }
    }

    /// Process one task to a terminal state. Never returns an error: every
    /// failure mode, panics included, is recorded on the task itself.
    pub async fn run(&self, task_id: Uuid, bytes: Vec<u8>, kind: SourceKind) {
        if let Err(e) = self.store.mark_processing(task_id).await {
            // Record vanished or was already claimed; nothing to do here.
            error!(%task_id, error = %e, "could not claim task, skipping");
            return;
        }
        debug!(%task_id, ?kind, size = bytes.len(), "task claimed");

        let outcome = AssertUnwindSafe(self.process(task_id, bytes, kind))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok((payload, usage))) => {
                info!(
                    %task_id,
                    total_tokens = usage.total_tokens,
                    "extraction completed"
                );
                self.store.complete(task_id, &payload, usage).await
            }
            Ok(Err(e)) => {
                warn!(%task_id, error = %e, "extraction failed");
                self.store.fail(task_id, &e.to_string()).await
            }
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                error!(%task_id, detail, "extraction panicked");
                self.store
                    .fail(task_id, &format!("internal error: {detail}"))
                    .await
            }
        };
        if let Err(e) = result {
            error!(%task_id, error = %e, "could not record task outcome");
        }
    }

    /// Happy path: render pages, load the instruction, call the backend.
    /// Any `Err` here becomes the task's FAILED message verbatim.
    async fn process(
        &self,
        task_id: Uuid,
        bytes: Vec<u8>,
        kind: SourceKind,
    ) -> Result<(String, TokenUsage), ExtractError> {
        let pages = render::render(bytes, kind, self.render_scale).await?;
        debug!(%task_id, pages = pages.len(), "document rendered");

        // Re-read per task so instruction edits apply without a restart.
        let instruction = prompts::load_instruction(self.instruction_path.as_deref()).await?;

        let extraction = self.backend.extract(&instruction, &pages).await?;
        Ok((extraction.payload, extraction.usage))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
