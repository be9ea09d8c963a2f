//! Service facade: validated submission, detached background processing,
//! and status polling.
//!
//! Submission is the synchronous half of the contract: every document in a
//! batch is validated (name, kind, size) before any record is created, so a
//! rejected batch leaves no trace in the store. Accepted documents get a
//! PENDING record each and a detached worker task; callers hold only the
//! returned ids and poll.

use crate::config::ServiceConfig;
use crate::error::ExtractError;
use crate::pipeline::client::{ExtractionBackend, GeminiClient};
use crate::pipeline::render::SourceKind;
use crate::runner::TaskRunner;
use crate::store::{StoreStats, TaskRecord, TaskStore};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One document handed to [`ExtractionService::submit`].
#[derive(Debug, Clone)]
pub struct SubmittedDocument {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Poll answer for a single id. `NotFound` is an answer, not an error, so
/// batch polls over mixed ids still succeed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status")]
pub enum StatusReport {
    #[serde(rename = "NOT_FOUND")]
    NotFound { task_id: Uuid },
    #[serde(untagged)]
    Known(TaskRecord),
}

impl StatusReport {
    pub fn record(&self) -> Option<&TaskRecord> {
        match self {
            Self::Known(record) => Some(record),
            Self::NotFound { .. } => None,
        }
    }
}

/// Asynchronous document-extraction service.
///
/// Cheap to clone; clones share the store, backend, and concurrency gate.
#[derive(Clone)]
pub struct ExtractionService {
    config: Arc<ServiceConfig>,
    store: TaskStore,
    runner: TaskRunner,
    /// Caps the number of documents in the pipeline at once. Permits are
    /// taken inside each worker task, so submission itself never blocks.
    gate: Arc<Semaphore>,
}

impl ExtractionService {
    /// Open the store named in the config and wire up the real Gemini
    /// backend. Runs the stale-task sweep before accepting work.
    pub async fn open(config: ServiceConfig) -> Result<Self, ExtractError> {
        let backend: Arc<dyn ExtractionBackend> = Arc::new(GeminiClient::new(&config)?);
        let store = TaskStore::open(&config.db_path)?;
        Self::with_parts(config, store, backend).await
    }

    /// Assemble from pre-built parts. This is the seam tests use to swap in
    /// an in-memory store and a scripted backend.
    pub async fn with_parts(
        config: ServiceConfig,
        store: TaskStore,
        backend: Arc<dyn ExtractionBackend>,
    ) -> Result<Self, ExtractError> {
        let swept = store.fail_stale_processing(config.recovery_grace_secs).await?;
        if swept > 0 {
            warn!(swept, "failed stale in-flight tasks from a previous run");
        }
        let runner = TaskRunner::new(
            store.clone(),
            backend,
            config.instruction_path.clone(),
            config.render_scale,
        );
        let gate = Arc::new(Semaphore::new(config.max_concurrent_tasks));
        Ok(Self {
            config: Arc::new(config),
            store,
            runner,
            gate,
        })
    }

    /// Validate and enqueue a batch of documents.
    ///
    /// All-or-nothing: the first invalid document rejects the whole batch
    /// before any record is created. On success the returned ids match the
    /// input order one-to-one.
    pub async fn submit(
        &self,
        submitter: &str,
        documents: Vec<SubmittedDocument>,
    ) -> Result<Vec<Uuid>, ExtractError> {
        let mut validated = Vec::with_capacity(documents.len());
        for doc in documents {
            let kind = self.validate(&doc)?;
            validated.push((doc, kind));
        }

        let mut task_ids = Vec::with_capacity(validated.len());
        for (doc, kind) in validated {
            let record = self.store.create_task(&doc.filename, submitter).await?;
            info!(
                task_id = %record.task_id,
                filename = %doc.filename,
                submitter,
                "task accepted"
            );
            task_ids.push(record.task_id);

            let runner = self.runner.clone();
            let gate = self.gate.clone();
            let task_id = record.task_id;
            tokio::spawn(async move {
                // Queue behind the concurrency cap; the record stays PENDING
                // until a permit frees up.
                let _permit = match gate.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                runner.run(task_id, doc.bytes, kind).await;
            });
        }
        Ok(task_ids)
    }

    fn validate(&self, doc: &SubmittedDocument) -> Result<SourceKind, ExtractError> {
        let kind = SourceKind::from_filename(&doc.filename).ok_or_else(|| {
            ExtractError::UnsupportedKind {
                filename: doc.filename.clone(),
            }
        })?;
        if doc.bytes.is_empty() {
            return Err(ExtractError::EmptyFile {
                filename: doc.filename.clone(),
            });
        }
        const MB: u64 = 1024 * 1024;
        let limit_mb = self.config.max_file_size_mb;
        let size = doc.bytes.len() as u64;
        if size > limit_mb * MB {
            return Err(ExtractError::FileTooLarge {
                filename: doc.filename.clone(),
                size_mb: size.div_ceil(MB),
                limit_mb,
            });
        }
        debug!(filename = %doc.filename, ?kind, "document validated");
        Ok(kind)
    }

    /// Current state of one task.
    pub async fn status(&self, task_id: Uuid) -> Result<StatusReport, ExtractError> {
        Ok(match self.store.get(task_id).await? {
            Some(record) => StatusReport::Known(record),
            None => StatusReport::NotFound { task_id },
        })
    }

    /// Current state of many tasks; the output order matches the input ids,
    /// unknown ids included.
    pub async fn batch_status(
        &self,
        task_ids: &[Uuid],
    ) -> Result<Vec<StatusReport>, ExtractError> {
        let mut reports = Vec::with_capacity(task_ids.len());
        for &task_id in task_ids {
            reports.push(self.status(task_id).await?);
        }
        Ok(reports)
    }

    /// Fail PROCESSING records older than `grace_secs`.
    ///
    /// Runs automatically with the configured grace when the service is
    /// assembled; exposed for operational use. Returns the number of records
    /// swept.
    pub async fn recover_stale(&self, grace_secs: u64) -> Result<usize, ExtractError> {
        self.store.fail_stale_processing(grace_secs).await
    }

    /// Newest-first task listing. See [`TaskStore::recent`].
    pub async fn recent(
        &self,
        limit: usize,
        status: Option<crate::store::TaskStatus>,
    ) -> Result<Vec<TaskRecord>, ExtractError> {
        self.store.recent(limit, status).await
    }

    /// Aggregate counters over the whole store.
    pub async fn stats(&self) -> Result<StoreStats, ExtractError> {
        self.store.stats().await
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }
}
