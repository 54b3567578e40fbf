//! Caseflow - compliance case pipeline
//!
//! A CLI that takes in applicant documents, runs the analysis agents over
//! them with live progress, and gates the final human decision.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime or boundary error (missing case, conflict, invalid decision, ...)
//!   2 - Pipeline finished without completing every required stage

mod agent;
mod audit;
mod cli;
mod config;
mod decision;
mod error;
mod models;
mod pipeline;
mod progress;
mod store;

use agent::AgentRegistry;
use anyhow::{Context, Result};
use audit::AuditLog;
use cli::{Args, Command};
use config::{Config, CONFIG_FILE_NAME};
use decision::RawDecision;
use error::ErrorPayload;
use futures::StreamExt;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use models::{Applicant, CaseId, Document, ProgressStatus, Stage};
use pipeline::{PipelineCoordinator, PipelineState};
use progress::{ProgressRegistry, ProgressStream, StreamMessage};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use store::CaseStore;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle init-config early (no logging needed)
    if args.command == Command::InitConfig {
        return handle_init_config();
    }

    let mut config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };
    config.merge_with_args(&args);

    init_logging(&args, &config);

    info!("Caseflow v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);
    debug!("State file: {}", config.general.state_file.display());

    match run(args, config).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle init-config: generate a default .caseflow.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(CONFIG_FILE_NAME);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            CONFIG_FILE_NAME
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", CONFIG_FILE_NAME))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE_NAME);
    println!("   Edit it to tune agent timeouts, the watchlist, and risk thresholds.");
    Ok(())
}

/// Initialize logging. `RUST_LOG` wins over the verbosity flags.
fn init_logging(args: &Args, config: &Config) {
    let level = if config.general.verbose && !args.quiet {
        tracing::Level::DEBUG
    } else {
        args.log_level()
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Load configuration from file or use defaults.
///
/// Runs before logging is initialized, so problems go straight to stderr.
fn load_config(args: &Args) -> Result<Config> {
    if let Some(ref config_path) = args.config {
        return Config::load(config_path);
    }

    match Config::load_default() {
        Ok(Some(config)) => Ok(config),
        Ok(None) => Ok(Config::default()),
        Err(e) => {
            eprintln!("⚠️  Ignoring {}: {:#}", CONFIG_FILE_NAME, e);
            Ok(Config::default())
        }
    }
}

/// Wire the store, registry, audit log and progress registry together.
fn build_coordinator(config: &Config) -> Result<Arc<PipelineCoordinator>> {
    let store = CaseStore::open(&config.general.state_file).with_context(|| {
        format!(
            "Failed to open state file {}",
            config.general.state_file.display()
        )
    })?;
    let store = Arc::new(store);

    let registry = AgentRegistry::from_config(config);
    registry
        .ensure_complete()
        .context("Agent registry is incomplete")?;

    let audit = AuditLog::new(store.clone(), config.audit.regulatory_notice.clone());
    let progress = ProgressRegistry::new(Duration::from_millis(config.stream.grace_period_ms));

    Ok(Arc::new(PipelineCoordinator::new(
        store, registry, audit, progress,
    )))
}

/// Dispatch a command. Returns the process exit code.
async fn run(args: Args, config: Config) -> Result<i32> {
    let coordinator = build_coordinator(&config)?;

    match args.command.clone() {
        Command::InitConfig => handle_init_config().map(|_| 0),
        Command::Intake {
            name,
            dob,
            nationality,
            documents,
        } => {
            let applicant = Applicant {
                full_name: name.trim().to_string(),
                date_of_birth: dob,
                nationality,
            };
            let documents = documents
                .iter()
                .map(|p| read_document(p))
                .collect::<Result<Vec<_>>>()?;
            handle_intake(&coordinator, applicant, documents).await
        }
        Command::AddDocument { case_id, path } => {
            let document = read_document(&path)?;
            match coordinator.add_document(case_id, document).await {
                Ok(case) => {
                    println!(
                        "📄 Added {} to case {} ({} documents)",
                        path.display(),
                        case_id,
                        case.documents.len()
                    );
                    Ok(0)
                }
                Err(e) => Ok(report_error(&e.to_payload())),
            }
        }
        Command::Run {
            case_id,
            retry,
            sse,
        } => handle_run(&coordinator, case_id, retry, sse, args.quiet).await,
        Command::List => handle_list(&coordinator).await,
        Command::Status { case_id, json } => handle_status(&coordinator, case_id, json).await,
        Command::Decide {
            case_id,
            decision,
            justification,
            officer_id,
            officer_name,
        } => {
            let raw = RawDecision {
                decision,
                justification,
                officer_id,
                officer_name,
            };
            handle_decide(&coordinator, case_id, &raw).await
        }
        Command::Audit {
            case_id,
            officer_id,
            output,
        } => handle_audit(&coordinator, case_id, &officer_id, output.as_deref()).await,
    }
}

/// Print a boundary error body and return the error exit code.
fn report_error(payload: &ErrorPayload) -> i32 {
    warn!("{}: {}", payload.error, payload.message);
    eprintln!("{}", payload.to_json());
    1
}

/// Document metadata for a local file. The file contents stay where they are.
fn read_document(path: &Path) -> Result<Document> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to read document {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(Document::new(file_name, metadata.len()))
}

async fn handle_intake(
    coordinator: &PipelineCoordinator,
    applicant: Applicant,
    documents: Vec<Document>,
) -> Result<i32> {
    match coordinator.intake(applicant, documents).await {
        Ok(case) => {
            println!("📥 Created case {}", case.id);
            println!("   Applicant: {}", case.applicant.full_name);
            println!("   Documents: {}", case.documents.len());
            if case.documents.is_empty() {
                println!("   Attach a document with `caseflow add-document` before running.");
            }
            Ok(0)
        }
        Err(e) => Ok(report_error(&e.to_payload())),
    }
}

async fn handle_run(
    coordinator: &Arc<PipelineCoordinator>,
    case_id: CaseId,
    retry: bool,
    sse: bool,
    quiet: bool,
) -> Result<i32> {
    let spawned = if retry {
        coordinator.spawn_retry(case_id).await
    } else {
        coordinator.spawn_lifecycle(case_id).await
    };
    let handle = match spawned {
        Ok(handle) => handle,
        Err(e) => return Ok(report_error(&e.to_payload())),
    };

    let stream = coordinator.progress().subscribe(case_id);
    if sse {
        print_sse(stream).await?;
    } else {
        if !quiet {
            println!("🔬 Running pipeline for case {}", case_id);
        }
        render_progress(stream, quiet).await;
    }

    let state = handle.await.context("Pipeline task panicked")?;
    match state {
        Ok(state) => {
            if !sse {
                print_summary(&state);
            }
            Ok(if state.success() { 0 } else { 2 })
        }
        Err(e) => Ok(report_error(&e.to_payload())),
    }
}

async fn print_sse(mut stream: ProgressStream) -> Result<()> {
    let mut stdout = std::io::stdout();
    while let Some(message) = stream.next().await {
        stdout
            .write_all(message.to_sse().as_bytes())
            .context("Failed to write progress stream")?;
        stdout.flush().context("Failed to write progress stream")?;
    }
    Ok(())
}

/// One spinner per agent stage, finished as each stage reports back.
async fn render_progress(mut stream: ProgressStream, quiet: bool) {
    let multi = MultiProgress::new();
    let style = ProgressStyle::default_spinner()
        .template("   {spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    let mut spinners: HashMap<Stage, ProgressBar> = HashMap::new();

    while let Some(message) = stream.next().await {
        let event = match message {
            StreamMessage::Progress(event) => event,
            StreamMessage::NoPipeline => {
                debug!("Progress stream reported no active pipeline");
                continue;
            }
            StreamMessage::Connected { .. } | StreamMessage::Done => continue,
        };

        if quiet || event.stage.is_pipeline_outcome() {
            continue;
        }

        match event.status {
            ProgressStatus::Started => {
                let pb = multi.add(ProgressBar::new_spinner());
                pb.set_style(style.clone());
                pb.enable_steady_tick(Duration::from_millis(100));
                pb.set_message(format!("{}...", event.stage));
                spinners.insert(event.stage, pb);
            }
            ProgressStatus::Completed => {
                if let Some(pb) = spinners.remove(&event.stage) {
                    pb.finish_with_message(format!(
                        "✅ {} (confidence {:.2})",
                        event.stage,
                        event.confidence.unwrap_or_default()
                    ));
                }
            }
            ProgressStatus::Failed => {
                if let Some(pb) = spinners.remove(&event.stage) {
                    pb.finish_with_message(format!(
                        "❌ {}: {}",
                        event.stage,
                        event.error.as_deref().unwrap_or("failed")
                    ));
                }
            }
        }
    }

    for (_, pb) in spinners {
        pb.abandon();
    }
}

fn print_summary(state: &PipelineState) {
    println!("\n📊 Pipeline Summary:");
    println!("   Case: {}", state.case_id);
    println!("   Outcome: {}", state.stage);
    println!("   Status: {}", state.case_status);
    if let (Some(score), Some(level)) = (state.risk_score, state.risk_level) {
        println!("   Risk: {} {} ({:.0}/100)", level.emoji(), level, score);
    }
    if let Some(review) = state.requires_manual_review {
        println!("   Manual review required: {}", if review { "yes" } else { "no" });
    }
    if !state.failed_agents.is_empty() {
        let failed: Vec<&str> = state.failed_agents.iter().map(|a| a.as_str()).collect();
        println!("   Failed agents: {}", failed.join(", "));
    }
    if let Some(ref narrative) = state.narrative {
        println!("\n📝 {}", narrative);
    }

    if state.success() {
        println!("\n✅ Case is ready for officer review.");
    } else {
        eprintln!(
            "\n⛔ Pipeline stopped: {} (exit code 2).",
            state.error.as_deref().unwrap_or("unknown error")
        );
    }
}

async fn handle_list(coordinator: &PipelineCoordinator) -> Result<i32> {
    let cases = coordinator.store().list_cases().await;
    if cases.is_empty() {
        println!("No cases yet. Create one with `caseflow intake`.");
        return Ok(0);
    }

    for case in &cases {
        let risk = match (case.risk_score, case.risk_level) {
            (Some(score), Some(level)) => format!("{} {:.0}", level.emoji(), score),
            _ => "-".to_string(),
        };
        println!(
            "{}  {:<10} {:<8} {}",
            case.id,
            case.status.as_str(),
            risk,
            case.applicant.full_name
        );
    }
    Ok(0)
}

async fn handle_status(
    coordinator: &PipelineCoordinator,
    case_id: CaseId,
    json: bool,
) -> Result<i32> {
    let case = match coordinator.store().get_case(case_id).await {
        Ok(case) => case,
        Err(e) => return Ok(report_error(&error::PipelineError::from(e).to_payload())),
    };
    let runs = coordinator.store().runs_for_case(case_id).await;
    let history = match coordinator.progress_history(case_id).await {
        Ok(history) => history,
        Err(e) => return Ok(report_error(&e.to_payload())),
    };

    if json {
        let body = serde_json::json!({
            "case": case,
            "agent_runs": runs,
            "progress": history,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&body).context("Failed to serialize status")?
        );
        return Ok(0);
    }

    println!("📁 Case {}", case.id);
    println!("   Applicant: {}", case.applicant.full_name);
    println!("   Status: {}", case.status);
    println!("   Documents: {}", case.documents.len());
    if let (Some(score), Some(level)) = (case.risk_score, case.risk_level) {
        println!("   Risk: {} {} ({:.0}/100)", level.emoji(), level, score);
    }
    if let Some(decision) = case.decision {
        println!(
            "   Decision: {} by {}",
            decision,
            case.decided_by.as_deref().unwrap_or("unknown")
        );
    }

    println!("\n🤖 Agent runs ({}):", runs.len());
    for run in &runs {
        let detail = match (&run.error, run.confidence) {
            (Some(err), _) => format!("error: {}", err),
            (None, Some(conf)) => format!("confidence {:.2}", conf),
            (None, None) => String::new(),
        };
        println!(
            "   {} {:<20} {:?} {}ms {}",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.agent_type.as_str(),
            run.status,
            run.duration_ms.unwrap_or_default(),
            detail
        );
    }

    println!("\n📈 Progress ({} events)", history.len());
    for event in &history {
        println!("   {} {:?}", event.stage, event.status);
    }

    if let Some(ref narrative) = case.narrative {
        println!("\n📝 {}", narrative);
    }
    Ok(0)
}

async fn handle_decide(
    coordinator: &PipelineCoordinator,
    case_id: CaseId,
    raw: &RawDecision,
) -> Result<i32> {
    match decision::decide(coordinator.store(), coordinator.audit(), case_id, raw).await {
        Ok(record) => {
            println!(
                "⚖️  Case {} is now {}",
                record.case.id, record.case.status
            );
            println!("   Recorded by: {}", record.audit_entry.actor_id);
            println!("   Audit entry: {}", record.audit_entry.id);
            Ok(0)
        }
        Err(e) => Ok(report_error(&e.to_payload())),
    }
}

async fn handle_audit(
    coordinator: &PipelineCoordinator,
    case_id: CaseId,
    officer_id: &str,
    output: Option<&Path>,
) -> Result<i32> {
    let csv = match coordinator.audit().export_csv(case_id, officer_id).await {
        Ok(csv) => csv,
        Err(e) => return Ok(report_error(&e.to_payload())),
    };

    match output {
        Some(path) => {
            std::fs::write(path, &csv)
                .with_context(|| format!("Failed to write audit export to {}", path.display()))?;
            println!("✅ Audit trail saved to: {}", path.display());
        }
        None => print!("{}", csv),
    }
    Ok(0)
}
