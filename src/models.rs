//! Data models for the compliance case pipeline.
//!
//! This module contains the core data structures shared by the store,
//! the agents, the coordinator and the audit trail.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a compliance case.
pub type CaseId = Uuid;

/// Lifecycle status of a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pending,
    Processing,
    Review,
    Approved,
    Denied,
    Escalated,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Pending => "pending",
            CaseStatus::Processing => "processing",
            CaseStatus::Review => "review",
            CaseStatus::Approved => "approved",
            CaseStatus::Denied => "denied",
            CaseStatus::Escalated => "escalated",
        }
    }

    /// Approved and denied cases are final; nothing automated may move them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CaseStatus::Approved | CaseStatus::Denied)
    }

    /// Statuses in which an officer may record a decision.
    pub fn is_decidable(&self) -> bool {
        matches!(
            self,
            CaseStatus::Review | CaseStatus::Processing | CaseStatus::Escalated
        )
    }

    /// Statuses from which the pipeline may be re-run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CaseStatus::Review | CaseStatus::Pending)
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human decision recorded by an officer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Denied,
    Escalated,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approved => "approved",
            Decision::Denied => "denied",
            Decision::Escalated => "escalated",
        }
    }

    /// The case status a decision moves the case into.
    pub fn resulting_status(&self) -> CaseStatus {
        match self {
            Decision::Approved => CaseStatus::Approved,
            Decision::Denied => CaseStatus::Denied,
            Decision::Escalated => CaseStatus::Escalated,
        }
    }

    /// Approved and denied are write-once; an escalation can still be resolved.
    pub fn is_final(&self) -> bool {
        matches!(self, Decision::Approved | Decision::Denied)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Decision::Approved),
            "denied" => Ok(Decision::Denied),
            "escalated" => Ok(Decision::Escalated),
            other => Err(format!("unknown decision: {}", other)),
        }
    }
}

/// Risk band derived from the numeric risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Score below 30
    Low,
    /// Score 30 to 59
    Medium,
    /// Score 60 to 79
    High,
    /// Score 80 and above
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            RiskLevel::Critical
        } else if score >= 60.0 {
            RiskLevel::High
        } else if score >= 30.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// Returns an emoji representation of the risk level.
    pub fn emoji(&self) -> &'static str {
        match self {
            RiskLevel::Low => "🟢",
            RiskLevel::Medium => "🟡",
            RiskLevel::High => "🟠",
            RiskLevel::Critical => "🔴",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "Low"),
            RiskLevel::Medium => write!(f, "Medium"),
            RiskLevel::High => write!(f, "High"),
            RiskLevel::Critical => write!(f, "Critical"),
        }
    }
}

/// Identity fields captured on intake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Applicant {
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nationality: Option<String>,
}

/// An uploaded identity document. Only metadata is kept; storage is external.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub file_name: String,
    pub size_bytes: u64,
    pub uploaded_at: DateTime<Utc>,
}

impl Document {
    pub fn new(file_name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_name: file_name.into(),
            size_bytes,
            uploaded_at: Utc::now(),
        }
    }
}

/// One applicant's compliance review unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub id: CaseId,
    pub applicant: Applicant,
    #[serde(default)]
    pub documents: Vec<Document>,
    pub status: CaseStatus,
    #[serde(default)]
    pub decision: Option<Decision>,
    #[serde(default)]
    pub decision_justification: Option<String>,
    #[serde(default)]
    pub decided_by: Option<String>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub risk_score: Option<f64>,
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
    #[serde(default)]
    pub narrative: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Case {
    /// Creates a new pending case.
    pub fn new(applicant: Applicant, documents: Vec<Document>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            applicant,
            documents,
            status: CaseStatus::Pending,
            decision: None,
            decision_justification: None,
            decided_by: None,
            decided_at: None,
            risk_score: None,
            risk_level: None,
            narrative: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The fixed set of analysis agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    DocumentProcessor,
    IdentityVerifier,
    SanctionsScreener,
    RiskScorer,
    CaseNarrator,
}

impl AgentType {
    pub const ALL: [AgentType; 5] = [
        AgentType::DocumentProcessor,
        AgentType::IdentityVerifier,
        AgentType::SanctionsScreener,
        AgentType::RiskScorer,
        AgentType::CaseNarrator,
    ];

    /// Stages with no upstream dependency, dispatched together.
    pub const INDEPENDENT: [AgentType; 3] = [
        AgentType::DocumentProcessor,
        AgentType::IdentityVerifier,
        AgentType::SanctionsScreener,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::DocumentProcessor => "document_processor",
            AgentType::IdentityVerifier => "identity_verifier",
            AgentType::SanctionsScreener => "sanctions_screener",
            AgentType::RiskScorer => "risk_scorer",
            AgentType::CaseNarrator => "case_narrator",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single agent execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Pending,
    Completed,
    Failed,
}

/// Persisted record of one execution attempt of one agent for one case.
///
/// Inserted as `Pending` when the stage starts and finalised exactly once.
/// A finalised run is never touched again; a retry creates a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: Uuid,
    pub case_id: CaseId,
    pub agent_type: AgentType,
    pub status: AgentRunStatus,
    pub input: Value,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A named point in the pipeline: one per agent plus the two pipeline outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    DocumentProcessor,
    IdentityVerifier,
    SanctionsScreener,
    RiskScorer,
    CaseNarrator,
    Completed,
    Failed,
}

impl Stage {
    pub fn is_pipeline_outcome(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }
}

impl From<AgentType> for Stage {
    fn from(agent_type: AgentType) -> Self {
        match agent_type {
            AgentType::DocumentProcessor => Stage::DocumentProcessor,
            AgentType::IdentityVerifier => Stage::IdentityVerifier,
            AgentType::SanctionsScreener => Stage::SanctionsScreener,
            AgentType::RiskScorer => Stage::RiskScorer,
            AgentType::CaseNarrator => Stage::CaseNarrator,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::DocumentProcessor => "document_processor",
            Stage::IdentityVerifier => "identity_verifier",
            Stage::SanctionsScreener => "sanctions_screener",
            Stage::RiskScorer => "risk_scorer",
            Stage::CaseNarrator => "case_narrator",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Started,
    Completed,
    Failed,
}

/// Live progress notification. Held in memory only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub status: ProgressStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn started(stage: impl Into<Stage>) -> Self {
        Self {
            stage: stage.into(),
            status: ProgressStatus::Started,
            confidence: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn completed(stage: impl Into<Stage>, confidence: Option<f64>) -> Self {
        Self {
            stage: stage.into(),
            status: ProgressStatus::Completed,
            confidence,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(stage: impl Into<Stage>, error: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            status: ProgressStatus::Failed,
            confidence: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    /// True for the event that ends a pipeline run and closes the stream.
    pub fn is_terminal(&self) -> bool {
        self.status == ProgressStatus::Completed && self.stage.is_pipeline_outcome()
    }

    /// Rebuilds the events a run would have emitted, for observers that
    /// reconnect after the in-memory bus is gone.
    pub fn from_run(run: &AgentRun) -> Vec<ProgressEvent> {
        let stage = Stage::from(run.agent_type);
        let mut events = vec![ProgressEvent {
            timestamp: run.started_at,
            ..ProgressEvent::started(stage)
        }];

        let finished_at = run.completed_at.unwrap_or(run.started_at);
        match run.status {
            AgentRunStatus::Pending => {}
            AgentRunStatus::Completed => events.push(ProgressEvent {
                timestamp: finished_at,
                ..ProgressEvent::completed(stage, run.confidence)
            }),
            AgentRunStatus::Failed => events.push(ProgressEvent {
                timestamp: finished_at,
                ..ProgressEvent::failed(stage, run.error.clone().unwrap_or_default())
            }),
        }

        events
    }
}

/// Who performed an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    System,
    Officer,
    Agent,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::System => "system",
            ActorType::Officer => "officer",
            ActorType::Agent => "agent",
        }
    }
}

/// Append-only regulatory record of a material event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub case_id: CaseId,
    pub actor_type: ActorType,
    pub actor_id: String,
    pub action: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

/// Normalised outcome of one agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub confidence: f64,
    pub duration_ms: u64,
    pub agent_type: AgentType,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl<T> AgentResult<T> {
    pub fn succeeded(agent_type: AgentType, data: T, confidence: f64, duration_ms: u64) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            confidence,
            duration_ms,
            agent_type,
            metadata: Map::new(),
        }
    }

    pub fn failed(agent_type: AgentType, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            confidence: 0.0,
            duration_ms,
            agent_type,
            metadata: Map::new(),
        }
    }
}
