//! Error types shared across the pipeline.
//!
//! Every boundary converts its error into an [`ErrorPayload`] so callers get a
//! structured body with a human-readable message.

use crate::models::{AgentType, CaseId, CaseStatus};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Failures of the persistence collaborator.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Case not found: {0}")]
    CaseNotFound(CaseId),

    #[error("Agent run not found: {0}")]
    RunNotFound(Uuid),

    #[error("A {agent_type} run is already pending for case {case_id}")]
    DuplicatePendingRun {
        case_id: CaseId,
        agent_type: AgentType,
    },

    #[error("Agent run {0} is already finalised")]
    RunAlreadyFinalised(Uuid),

    #[error("Case {case_id} cannot move from {from} to {to}")]
    InvalidTransition {
        case_id: CaseId,
        from: CaseStatus,
        to: CaseStatus,
    },

    #[error("State file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State file serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to persist state file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Raised when a capability was never registered. This is an integration bug.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No handler registered for agent type {0}")]
pub struct UnregisteredAgentError(pub AgentType);

/// Failures surfaced by the pipeline coordinator.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Case not found: {0}")]
    NotFound(CaseId),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Case {0} has no documents to process")]
    NoDocuments(CaseId),

    #[error(transparent)]
    Unregistered(#[from] UnregisteredAgentError),

    #[error("Storage error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::CaseNotFound(id) => PipelineError::NotFound(id),
            StoreError::InvalidTransition { case_id, from, to } => PipelineError::Conflict(
                format!("case {} is {}, cannot move to {}", case_id, from, to),
            ),
            dup @ StoreError::DuplicatePendingRun { .. } => PipelineError::Conflict(dup.to_string()),
            other => PipelineError::Store(other),
        }
    }
}

impl PipelineError {
    /// HTTP-equivalent status code.
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::NotFound(_) => 404,
            PipelineError::Conflict(_) => 409,
            PipelineError::NoDocuments(_) => 422,
            PipelineError::Unregistered(_) | PipelineError::Store(_) => 500,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        let kind = match self {
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Conflict(_) => "conflict",
            PipelineError::NoDocuments(_) => "no_documents",
            PipelineError::Unregistered(_) | PipelineError::Store(_) => "internal",
        };
        ErrorPayload::new(kind, self.to_string(), self.status_code())
    }
}

/// Structured error body returned by every boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub status_code: u16,
    /// Set when the request broke a regulatory rule rather than failing generically.
    pub regulatory_requirement: bool,
}

impl ErrorPayload {
    pub fn new(error: impl Into<String>, message: impl Into<String>, status_code: u16) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            field: None,
            status_code,
            regulatory_requirement: false,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| self.message.clone())
    }
}
