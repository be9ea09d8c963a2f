//! End-to-end lifecycle tests against the public service API.
//!
//! Everything here runs offline with a scripted backend; the last test talks
//! to the real Gemini API and pdfium, and only runs when the environment
//! opts in:
//!
//! ```bash
//! DOCUVISION_E2E=1 GEMINI_API_KEY=... DOCUVISION_E2E_FILE=sample.pdf \
//!     cargo test --test lifecycle -- --nocapture
//! ```

use async_trait::async_trait;
use docuvision::{
    Extraction, ExtractionBackend, ExtractionService, ExtractError, PageImage, ServiceConfig,
    StatusReport, SubmittedDocument, TaskStatus, TaskStore, TokenUsage,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Skip the current test unless live end-to-end runs are enabled.
macro_rules! require_live_env {
    () => {
        if std::env::var("DOCUVISION_E2E").map(|v| v == "1") != Ok(true) {
            eprintln!("skipping live test; set DOCUVISION_E2E=1 to enable");
            return;
        }
    };
}

struct ScriptedBackend {
    calls: AtomicUsize,
    outcome: Box<dyn Fn() -> Result<Extraction, ExtractError> + Send + Sync>,
}

#[async_trait]
impl ExtractionBackend for ScriptedBackend {
    async fn extract(
        &self,
        _instruction: &str,
        _pages: &[PageImage],
    ) -> Result<Extraction, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.outcome)()
    }
}

fn scripted(
    outcome: impl Fn() -> Result<Extraction, ExtractError> + Send + Sync + 'static,
) -> Arc<ScriptedBackend> {
    Arc::new(ScriptedBackend {
        calls: AtomicUsize::new(0),
        outcome: Box::new(outcome),
    })
}

fn succeeding() -> Arc<ScriptedBackend> {
    scripted(|| {
        Ok(Extraction {
            payload: r#"{"vendor":"ACME Corp","total":118.90}"#.to_string(),
            usage: TokenUsage {
                prompt_tokens: 1200,
                completion_tokens: 340,
                total_tokens: 1540,
            },
        })
    })
}

fn test_config() -> ServiceConfig {
    ServiceConfig::builder()
        .api_key("offline-test-key")
        .max_concurrent_tasks(3)
        .build()
        .expect("config")
}

async fn offline_service(backend: Arc<ScriptedBackend>) -> ExtractionService {
    ExtractionService::with_parts(
        test_config(),
        TaskStore::in_memory().expect("store"),
        backend,
    )
    .await
    .expect("service")
}

fn png_doc(name: &str) -> SubmittedDocument {
    let mut buf = std::io::Cursor::new(Vec::new());
    let img = image::RgbImage::from_pixel(4, 4, image::Rgb([200, 200, 200]));
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, image::ImageFormat::Png)
        .expect("encode");
    SubmittedDocument {
        filename: name.to_string(),
        bytes: buf.into_inner(),
    }
}

async fn poll_terminal(service: &ExtractionService, id: Uuid) -> docuvision::TaskRecord {
    for _ in 0..300 {
        if let StatusReport::Known(record) = service.status(id).await.expect("status") {
            if record.status.is_terminal() {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} never reached a terminal state");
}

#[tokio::test]
async fn submitted_image_completes_with_payload_and_counters() {
    let backend = succeeding();
    let service = offline_service(backend.clone()).await;

    let ids = service
        .submit("billing", vec![png_doc("receipt.png")])
        .await
        .expect("submit");
    assert_eq!(ids.len(), 1);

    let record = poll_terminal(&service, ids[0]).await;
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.filename, "receipt.png");
    assert_eq!(record.submitter, "billing");
    assert_eq!(
        record.payload.as_deref(),
        Some(r#"{"vendor":"ACME Corp","total":118.90}"#)
    );
    assert_eq!(record.prompt_tokens, Some(1200));
    assert_eq!(record.completion_tokens, Some(340));
    assert_eq!(record.total_tokens, Some(1540));
    assert!(record.error_message.is_none());
    assert!(record.completed_at.is_some());
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn corrupt_pdf_fails_without_calling_the_backend() {
    let backend = succeeding();
    let service = offline_service(backend.clone()).await;

    let ids = service
        .submit(
            "billing",
            vec![SubmittedDocument {
                filename: "garbage.pdf".to_string(),
                bytes: b"this is not a pdf at all".to_vec(),
            }],
        )
        .await
        .expect("submit");

    let record = poll_terminal(&service, ids[0]).await;
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(record.error_message.is_some());
    assert!(record.payload.is_none());
    assert!(record.total_tokens.is_none());
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn auth_failure_is_reported_on_the_task() {
    let backend = scripted(|| {
        Err(ExtractError::AuthFailed {
            status: 403,
            detail: "API key expired".to_string(),
        })
    });
    let service = offline_service(backend).await;

    let ids = service
        .submit("billing", vec![png_doc("scan.png")])
        .await
        .expect("submit");

    let record = poll_terminal(&service, ids[0]).await;
    assert_eq!(record.status, TaskStatus::Failed);
    let message = record.error_message.expect("message");
    assert!(
        message.contains("authentication") && message.contains("credentials"),
        "got: {message}"
    );
    assert!(record.prompt_tokens.is_none());
    assert!(record.completion_tokens.is_none());
    assert!(record.total_tokens.is_none());
}

#[tokio::test]
async fn batch_of_images_keeps_id_order_under_concurrency() {
    let backend = succeeding();
    let service = offline_service(backend).await;

    let docs: Vec<_> = (0..5).map(|i| png_doc(&format!("page{i}.png"))).collect();
    let ids = service.submit("bulk", docs).await.expect("submit");
    assert_eq!(ids.len(), 5);

    for (i, id) in ids.iter().enumerate() {
        let record = poll_terminal(&service, *id).await;
        assert_eq!(record.filename, format!("page{i}.png"));
        assert_eq!(record.status, TaskStatus::Completed);
    }

    let reports = service.batch_status(&ids).await.expect("batch");
    let ordered: Vec<_> = reports
        .iter()
        .map(|r| r.record().expect("known").filename.clone())
        .collect();
    assert_eq!(ordered, vec!["page0.png", "page1.png", "page2.png", "page3.png", "page4.png"]);
}

#[tokio::test]
async fn startup_sweep_fails_tasks_orphaned_by_a_crash() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("tasks.sqlite");

    // A previous process claimed a task and died before finishing it.
    {
        let store = TaskStore::open(&db_path).expect("store");
        let orphan = store.create_task("stuck.pdf", "u").await.expect("create");
        store.mark_processing(orphan.task_id).await.expect("mark");
    }

    let config = ServiceConfig::builder()
        .api_key("offline-test-key")
        .db_path(&db_path)
        .recovery_grace_secs(0)
        .build()
        .expect("config");
    let service = ExtractionService::with_parts(
        config,
        TaskStore::open(&db_path).expect("store"),
        succeeding(),
    )
    .await
    .expect("service");

    let stuck = service
        .recent(10, Some(TaskStatus::Failed))
        .await
        .expect("recent");
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].filename, "stuck.pdf");
    assert!(stuck[0]
        .error_message
        .as_deref()
        .expect("message")
        .contains("worker terminated"));
}

#[tokio::test]
async fn unknown_id_polls_as_not_found_not_error() {
    let service = offline_service(succeeding()).await;
    let ghost = Uuid::new_v4();

    let report = service.status(ghost).await.expect("status");
    assert!(matches!(report, StatusReport::NotFound { task_id } if task_id == ghost));

    let json = serde_json::to_value(&report).expect("json");
    assert_eq!(json["status"], "NOT_FOUND");
}

/// Live run against pdfium and the real Gemini API.
#[tokio::test]
async fn live_extraction_of_a_real_document() {
    require_live_env!();

    let path = match std::env::var("DOCUVISION_E2E_FILE") {
        Ok(p) => p,
        Err(_) => {
            eprintln!("skipping live test; set DOCUVISION_E2E_FILE to a PDF or image");
            return;
        }
    };
    let bytes = std::fs::read(&path).expect("read live test file");
    let filename = std::path::Path::new(&path)
        .file_name()
        .and_then(|n| n.to_str())
        .expect("file name")
        .to_string();

    let config = ServiceConfig::from_env().expect("GEMINI_API_KEY must be set");
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = config;
    config.db_path = dir.path().join("live.sqlite");

    let service = ExtractionService::open(config).await.expect("service");
    let ids = service
        .submit("e2e", vec![SubmittedDocument { filename, bytes }])
        .await
        .expect("submit");

    let record = poll_terminal(&service, ids[0]).await;
    eprintln!("live task finished as {}", record.status);
    assert_eq!(record.status, TaskStatus::Completed, "{:?}", record.error_message);
    let payload = record.payload.expect("payload");
    assert!(!payload.trim().is_empty());
    assert!(record.total_tokens.expect("tokens") > 0);
}
