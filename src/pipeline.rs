//! Pipeline coordinator.
//!
//! Drives one case through the agent graph:
//!
//! ```text
//! document_processor ┐
//! identity_verifier  ├─> risk_scorer ──> case_narrator
//! sanctions_screener ┘
//! ```
//!
//! The three independent stages run concurrently and are all awaited. The
//! join stage reads the latest completed run of each upstream type and may
//! proceed with any non-empty subset. The narrator only runs after a
//! completed risk assessment. Moving a case from `pending` to `processing`
//! is a compare-and-set, which keeps two invocations off the same case.

use crate::agent::handlers::{AgentInput, AgentOutput, RiskAssessment, UpstreamResult};
use crate::agent::harness;
use crate::agent::registry::AgentRegistry;
use crate::audit::AuditLog;
use crate::error::{PipelineError, StoreError};
use crate::models::{
    AgentResult, AgentRun, AgentType, Applicant, Case, CaseId, CaseStatus, Document,
    ProgressEvent, RiskLevel, Stage,
};
use crate::progress::{ProgressBus, ProgressRegistry};
use crate::store::{CaseStore, RunOutcome};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const NO_UPSTREAM_RESULTS: &str = "no upstream results";

/// Outcome of one pipeline invocation.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineState {
    pub case_id: CaseId,
    /// `completed` when every required stage finished, `failed` otherwise.
    pub stage: Stage,
    pub case_status: CaseStatus,
    pub error: Option<String>,
    pub failed_agents: Vec<AgentType>,
    pub risk_score: Option<f64>,
    pub risk_level: Option<RiskLevel>,
    pub requires_manual_review: Option<bool>,
    pub narrative: Option<String>,
}

impl PipelineState {
    pub fn success(&self) -> bool {
        self.stage == Stage::Completed
    }
}

/// Result of one stage: the finalised run and the harness envelope.
struct StageOutcome {
    run: AgentRun,
    result: AgentResult<AgentOutput>,
}

impl StageOutcome {
    fn output(&self) -> Option<&AgentOutput> {
        self.result.data.as_ref()
    }
}

pub struct PipelineCoordinator {
    store: Arc<CaseStore>,
    registry: AgentRegistry,
    audit: AuditLog,
    progress: ProgressRegistry,
}

impl PipelineCoordinator {
    pub fn new(
        store: Arc<CaseStore>,
        registry: AgentRegistry,
        audit: AuditLog,
        progress: ProgressRegistry,
    ) -> Self {
        Self {
            store,
            registry,
            audit,
            progress,
        }
    }

    pub fn store(&self) -> &Arc<CaseStore> {
        &self.store
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn progress(&self) -> &ProgressRegistry {
        &self.progress
    }

    /// Create a pending case.
    pub async fn intake(
        &self,
        applicant: Applicant,
        documents: Vec<Document>,
    ) -> Result<Case, PipelineError> {
        let case = self.store.insert_case(Case::new(applicant, documents)).await?;
        self.audit
            .log_system_event(
                case.id,
                "case_created",
                json!({ "documents": case.documents.len() }),
            )
            .await;
        info!("Created case {} with {} documents", case.id, case.documents.len());
        Ok(case)
    }

    /// Attach a document to a case that has not been finally decided.
    pub async fn add_document(
        &self,
        case_id: CaseId,
        document: Document,
    ) -> Result<Case, PipelineError> {
        let summary = json!({
            "document_id": document.id,
            "file_name": document.file_name,
            "size_bytes": document.size_bytes,
        });

        let mut rejected = None;
        let result = self
            .store
            .update_case(case_id, |case| {
                if case.status.is_terminal() {
                    rejected = Some(case.status);
                    return Err(StoreError::InvalidTransition {
                        case_id,
                        from: case.status,
                        to: case.status,
                    });
                }
                case.documents.push(document);
                Ok(())
            })
            .await;

        let case = match (result, rejected) {
            (Ok(case), _) => case,
            (Err(_), Some(status)) => {
                return Err(PipelineError::Conflict(format!(
                    "case {} is {}; documents can no longer be added",
                    case_id, status
                )))
            }
            (Err(e), None) => return Err(e.into()),
        };

        self.audit
            .log_system_event(case_id, "document_uploaded", summary)
            .await;
        Ok(case)
    }

    /// Run the full pipeline for a pending case and wait for it to finish.
    pub async fn process_case_lifecycle(
        &self,
        case_id: CaseId,
    ) -> Result<PipelineState, PipelineError> {
        let (case, bus) = self.prepare(case_id).await?;
        self.drive(case, bus).await
    }

    /// Start the pipeline in the background.
    ///
    /// Preconditions are checked and the progress bus is open before this
    /// returns, so a subscriber attached afterwards sees every event.
    pub async fn spawn_lifecycle(
        self: &Arc<Self>,
        case_id: CaseId,
    ) -> Result<JoinHandle<Result<PipelineState, PipelineError>>, PipelineError> {
        let (case, bus) = self.prepare(case_id).await?;
        let coordinator = Arc::clone(self);
        Ok(tokio::spawn(async move { coordinator.drive(case, bus).await }))
    }

    /// Reset a reviewable case and run the pipeline again.
    ///
    /// Earlier runs are kept; the new invocation writes fresh ones.
    pub async fn retry(&self, case_id: CaseId) -> Result<PipelineState, PipelineError> {
        let (case, bus) = self.prepare_retry(case_id).await?;
        self.drive(case, bus).await
    }

    /// Background variant of [`retry`](Self::retry).
    pub async fn spawn_retry(
        self: &Arc<Self>,
        case_id: CaseId,
    ) -> Result<JoinHandle<Result<PipelineState, PipelineError>>, PipelineError> {
        let (case, bus) = self.prepare_retry(case_id).await?;
        let coordinator = Arc::clone(self);
        Ok(tokio::spawn(async move { coordinator.drive(case, bus).await }))
    }

    async fn prepare_retry(
        &self,
        case_id: CaseId,
    ) -> Result<(Case, Arc<ProgressBus>), PipelineError> {
        let previous = self
            .store
            .update_case(case_id, |case| {
                if !case.status.is_retryable() {
                    return Err(StoreError::InvalidTransition {
                        case_id,
                        from: case.status,
                        to: CaseStatus::Pending,
                    });
                }
                case.status = CaseStatus::Pending;
                case.risk_score = None;
                case.risk_level = None;
                case.narrative = None;
                Ok(())
            })
            .await?;

        self.audit
            .log_system_event(
                case_id,
                "pipeline_retry",
                json!({ "documents": previous.documents.len() }),
            )
            .await;
        info!("Retrying pipeline for case {}", case_id);

        self.prepare(case_id).await
    }

    /// Progress for a case: the live buffer while a bus exists, otherwise the
    /// sequence rebuilt from persisted runs.
    pub async fn progress_history(
        &self,
        case_id: CaseId,
    ) -> Result<Vec<ProgressEvent>, PipelineError> {
        if let Some(bus) = self.progress.get(case_id) {
            return Ok(bus.events());
        }

        self.store.get_case(case_id).await?;
        let mut events: Vec<ProgressEvent> = self
            .store
            .runs_for_case(case_id)
            .await
            .iter()
            .flat_map(ProgressEvent::from_run)
            .collect();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    async fn prepare(&self, case_id: CaseId) -> Result<(Case, Arc<ProgressBus>), PipelineError> {
        let case = self.store.get_case(case_id).await?;

        if case.status != CaseStatus::Pending {
            return Err(PipelineError::Conflict(format!(
                "case {} is {}; the pipeline only starts from pending",
                case_id, case.status
            )));
        }
        if case.documents.is_empty() {
            return Err(PipelineError::NoDocuments(case_id));
        }
        self.registry.ensure_complete()?;

        let case = self
            .store
            .transition_status(case_id, &[CaseStatus::Pending], CaseStatus::Processing)
            .await?;
        let bus = self.progress.open(case_id);
        bus.on(move |event| {
            debug!("Case {}: {} {:?}", case_id, event.stage, event.status);
            Ok(())
        });

        self.audit
            .log_system_event(
                case_id,
                "pipeline_started",
                json!({ "documents": case.documents.len() }),
            )
            .await;
        info!("Pipeline started for case {}", case_id);

        Ok((case, bus))
    }

    async fn drive(
        &self,
        case: Case,
        bus: Arc<ProgressBus>,
    ) -> Result<PipelineState, PipelineError> {
        let case_id = case.id;

        match self.run_stages(&case, &bus).await {
            Ok(state) => {
                let terminal = if state.success() {
                    ProgressEvent::completed(Stage::Completed, None)
                } else {
                    ProgressEvent {
                        error: state.error.clone(),
                        ..ProgressEvent::completed(Stage::Failed, None)
                    }
                };

                self.audit
                    .log_system_event(
                        case_id,
                        if state.success() {
                            "pipeline_completed"
                        } else {
                            "pipeline_failed"
                        },
                        json!({
                            "stage": state.stage,
                            "error": state.error,
                            "failed_agents": state.failed_agents,
                            "risk_score": state.risk_score,
                        }),
                    )
                    .await;

                bus.emit(terminal);
                self.progress.schedule_teardown(&bus);
                info!("Pipeline for case {} finished at {}", case_id, state.stage);
                Ok(state)
            }
            Err(e) => {
                error!("Pipeline for case {} aborted: {}", case_id, e);

                if let Err(release) = self.release_case(case_id).await {
                    warn!("Could not release case {}: {}", case_id, release);
                }
                self.audit
                    .log_system_event(case_id, "pipeline_failed", json!({ "error": e.to_string() }))
                    .await;

                bus.emit(ProgressEvent {
                    error: Some(e.to_string()),
                    ..ProgressEvent::completed(Stage::Failed, None)
                });
                self.progress.schedule_teardown(&bus);
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        case: &Case,
        bus: &ProgressBus,
    ) -> Result<PipelineState, PipelineError> {
        let case_id = case.id;
        let mut failed_agents = Vec::new();

        let (documents, identity, sanctions) = futures::join!(
            self.run_stage(case, AgentType::DocumentProcessor, Vec::new(), bus),
            self.run_stage(case, AgentType::IdentityVerifier, Vec::new(), bus),
            self.run_stage(case, AgentType::SanctionsScreener, Vec::new(), bus),
        );
        for outcome in [documents?, identity?, sanctions?] {
            if !outcome.result.success {
                failed_agents.push(outcome.result.agent_type);
            }
        }

        let mut upstream = Vec::new();
        for agent_type in AgentType::INDEPENDENT {
            if let Some(run) = self.store.latest_completed(case_id, agent_type).await {
                if let Some(result) = upstream_from_run(&run) {
                    upstream.push(result);
                }
            }
        }

        let risk = if upstream.is_empty() {
            self.fail_stage(case, AgentType::RiskScorer, NO_UPSTREAM_RESULTS, bus)
                .await?
        } else {
            self.run_stage(case, AgentType::RiskScorer, upstream, bus)
                .await?
        };

        let assessment = match risk.output() {
            Some(AgentOutput::Risk(assessment)) => assessment.clone(),
            _ => {
                failed_agents.push(AgentType::RiskScorer);
                let error = risk
                    .result
                    .error
                    .clone()
                    .unwrap_or_else(|| "risk assessment unavailable".to_string());
                return self.finish(case_id, Stage::Failed, Some(error), failed_agents, None).await;
            }
        };

        self.store
            .update_case(case_id, |c| {
                if !c.status.is_terminal() {
                    c.risk_score = Some(assessment.risk_score);
                    c.risk_level = Some(assessment.risk_level);
                }
                Ok(())
            })
            .await?;

        let narrator_upstream = upstream_from_run(&risk.run).into_iter().collect();
        let narrative = self
            .run_stage(case, AgentType::CaseNarrator, narrator_upstream, bus)
            .await?;

        match narrative.output() {
            Some(AgentOutput::Narrative(n)) => {
                let summary = n.summary.clone();
                self.store
                    .update_case(case_id, |c| {
                        if !c.status.is_terminal() {
                            c.narrative = Some(summary);
                        }
                        Ok(())
                    })
                    .await?;
                self.finish(case_id, Stage::Completed, None, failed_agents, Some(&assessment))
                    .await
            }
            _ => {
                failed_agents.push(AgentType::CaseNarrator);
                let error = narrative
                    .result
                    .error
                    .clone()
                    .unwrap_or_else(|| "narrative unavailable".to_string());
                self.finish(case_id, Stage::Failed, Some(error), failed_agents, Some(&assessment))
                    .await
            }
        }
    }

    /// Hand the case to an officer and build the returned state.
    async fn finish(
        &self,
        case_id: CaseId,
        stage: Stage,
        error: Option<String>,
        failed_agents: Vec<AgentType>,
        assessment: Option<&RiskAssessment>,
    ) -> Result<PipelineState, PipelineError> {
        let case = self.release_case(case_id).await?;

        Ok(PipelineState {
            case_id,
            stage,
            case_status: case.status,
            error,
            failed_agents,
            risk_score: case.risk_score,
            risk_level: case.risk_level,
            requires_manual_review: assessment.map(|a| a.requires_manual_review),
            narrative: case.narrative,
        })
    }

    /// Move a processing case to review. Decided cases keep their status.
    async fn release_case(&self, case_id: CaseId) -> Result<Case, StoreError> {
        self.store
            .update_case(case_id, |c| {
                if c.status == CaseStatus::Processing {
                    c.status = CaseStatus::Review;
                }
                Ok(())
            })
            .await
    }

    async fn run_stage(
        &self,
        case: &Case,
        agent_type: AgentType,
        upstream: Vec<UpstreamResult>,
        bus: &ProgressBus,
    ) -> Result<StageOutcome, PipelineError> {
        let entry = self.registry.resolve(agent_type)?;
        let input = AgentInput {
            case_id: case.id,
            applicant: case.applicant.clone(),
            documents: case.documents.clone(),
            upstream,
        };
        let snapshot = serde_json::to_value(&input).map_err(StoreError::from)?;

        let run = self.store.begin_run(case.id, agent_type, snapshot).await?;
        bus.emit(ProgressEvent::started(agent_type));

        let result = harness::run(agent_type, input, &entry.config, |input| {
            entry.handler.handle(input)
        })
        .await;

        self.record(run, result, bus).await
    }

    /// Record a stage that cannot run, without invoking its handler.
    async fn fail_stage(
        &self,
        case: &Case,
        agent_type: AgentType,
        reason: &str,
        bus: &ProgressBus,
    ) -> Result<StageOutcome, PipelineError> {
        let run = self
            .store
            .begin_run(case.id, agent_type, json!({ "case_id": case.id, "upstream": [] }))
            .await?;
        bus.emit(ProgressEvent::started(agent_type));
        warn!("{} skipped for case {}: {}", agent_type, case.id, reason);

        self.record(run, AgentResult::failed(agent_type, reason, 0), bus)
            .await
    }

    async fn record(
        &self,
        run: AgentRun,
        result: AgentResult<AgentOutput>,
        bus: &ProgressBus,
    ) -> Result<StageOutcome, PipelineError> {
        let run = self
            .store
            .finish_run(run.id, RunOutcome::from(&result))
            .await?;
        self.audit
            .log_agent_outcome(run.case_id, run.id, &result)
            .await;

        if result.success {
            bus.emit(ProgressEvent::completed(
                result.agent_type,
                Some(result.confidence),
            ));
        } else {
            bus.emit(ProgressEvent::failed(
                result.agent_type,
                result.error.clone().unwrap_or_default(),
            ));
        }

        Ok(StageOutcome { run, result })
    }
}

fn upstream_from_run(run: &AgentRun) -> Option<UpstreamResult> {
    let output = run.output.clone()?;
    match serde_json::from_value::<AgentOutput>(output) {
        Ok(output) => Some(UpstreamResult {
            agent_type: run.agent_type,
            run_id: run.id,
            confidence: run.confidence,
            output,
        }),
        Err(e) => {
            warn!("Ignoring unreadable output of run {}: {}", run.id, e);
            None
        }
    }
}
