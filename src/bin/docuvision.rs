//! Command-line front end for the extraction service.
//!
//! Submits documents, polls task status, and inspects the store. The API key
//! comes from `GEMINI_API_KEY`; see `ServiceConfig::from_env` for the rest
//! of the environment knobs.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use docuvision::{
    ExtractionService, ServiceConfig, StatusReport, SubmittedDocument, TaskStatus,
};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "docuvision",
    version,
    about = "Extract structured data from PDFs and scanned images"
)]
struct Cli {
    /// SQLite database holding task records.
    #[arg(long, global = true, env = "DATABASE_PATH")]
    db: Option<PathBuf>,

    /// Emit raw JSON instead of human-readable output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit one or more documents and wait for the results.
    Submit {
        /// PDF, JPEG, or PNG files to process.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Name recorded as the task submitter.
        #[arg(long, default_value = "cli")]
        submitter: String,

        /// Return the task ids immediately instead of waiting.
        #[arg(long)]
        no_wait: bool,

        /// Custom extraction instruction file (re-read per task).
        #[arg(long, env = "INSTRUCTION_PATH")]
        instruction: Option<PathBuf>,
    },
    /// Show the current state of one or more tasks.
    Status {
        #[arg(required = true)]
        task_ids: Vec<Uuid>,
    },
    /// List recent tasks, newest first.
    Recent {
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Filter by status (PENDING, PROCESSING, COMPLETED, FAILED).
        #[arg(long)]
        status: Option<String>,
    },
    /// Show aggregate task counts and token usage.
    Stats,
    /// Fail tasks left in PROCESSING by a terminated worker.
    Recover {
        /// Only sweep tasks older than this many seconds.
        #[arg(long, default_value_t = 0)]
        grace_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docuvision=info".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = ServiceConfig::from_env().context("loading configuration")?;
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    if let Command::Submit {
        instruction: Some(path),
        ..
    } = &cli.command
    {
        config.instruction_path = Some(path.clone());
    }

    let service = ExtractionService::open(config)
        .await
        .context("opening extraction service")?;

    match cli.command {
        Command::Submit {
            files,
            submitter,
            no_wait,
            ..
        } => submit(&service, files, &submitter, no_wait, cli.json).await,
        Command::Status { task_ids } => status(&service, &task_ids, cli.json).await,
        Command::Recent { limit, status } => recent(&service, limit, status, cli.json).await,
        Command::Stats => stats(&service, cli.json).await,
        Command::Recover { grace_secs } => {
            let swept = service.recover_stale(grace_secs).await?;
            println!("swept {swept} task(s) to FAILED");
            Ok(())
        }
    }
}

async fn submit(
    service: &ExtractionService,
    files: Vec<PathBuf>,
    submitter: &str,
    no_wait: bool,
    json: bool,
) -> Result<()> {
    let mut documents = Vec::with_capacity(files.len());
    for path in &files {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("invalid file name: {}", path.display()))?
            .to_string();
        let bytes =
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        documents.push(SubmittedDocument { filename, bytes });
    }

    let ids = service
        .submit(submitter, documents)
        .await
        .context("submission rejected")?;

    if no_wait {
        for (path, id) in files.iter().zip(&ids) {
            println!("{id}  {}", path.display());
        }
        return Ok(());
    }

    // Poll until every task reaches a terminal state.
    let mut reports = loop {
        let reports = service.batch_status(&ids).await?;
        let all_done = reports.iter().all(|r| {
            r.record()
                .map(|rec| rec.status.is_terminal())
                .unwrap_or(true)
        });
        if all_done {
            break reports;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }
    let mut failed = 0usize;
    for report in reports.drain(..) {
        let Some(record) = report.record() else { continue };
        match record.status {
            TaskStatus::Completed => {
                eprintln!(
                    "{} completed ({} tokens)",
                    record.filename,
                    record.total_tokens.unwrap_or(0)
                );
                println!("{}", record.payload.as_deref().unwrap_or(""));
            }
            TaskStatus::Failed => {
                failed += 1;
                eprintln!(
                    "{} failed: {}",
                    record.filename,
                    record.error_message.as_deref().unwrap_or("unknown error")
                );
            }
            _ => {}
        }
    }
    if failed > 0 {
        bail!("{failed} task(s) failed");
    }
    Ok(())
}

async fn status(service: &ExtractionService, task_ids: &[Uuid], json: bool) -> Result<()> {
    let reports = service.batch_status(task_ids).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }
    for report in &reports {
        match report {
            StatusReport::NotFound { task_id } => println!("{task_id}  NOT_FOUND"),
            StatusReport::Known(record) => {
                println!("{}  {}  {}", record.task_id, record.status, record.filename);
            }
        }
    }
    Ok(())
}

async fn recent(
    service: &ExtractionService,
    limit: usize,
    status: Option<String>,
    json: bool,
) -> Result<()> {
    let filter = status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()?;
    let records = service.recent(limit, filter).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    for record in &records {
        println!(
            "{}  {}  {}  {}",
            record.task_id,
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.status,
            record.filename
        );
    }
    Ok(())
}

async fn stats(service: &ExtractionService, json: bool) -> Result<()> {
    let stats = service.stats().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!("pending      {}", stats.pending);
    println!("processing   {}", stats.processing);
    println!("completed    {}", stats.completed);
    println!("failed       {}", stats.failed);
    println!("tokens used  {}", stats.total_tokens_used);
    Ok(())
}
