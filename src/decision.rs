//! Human decision gate.
//!
//! An officer's decision is validated before anything is written: the
//! decision value must be known, the justification must carry a real
//! rationale and the officer must be identified. Only then is the case
//! checked and updated, and exactly one audit entry recorded.

use crate::audit::AuditLog;
use crate::error::{ErrorPayload, StoreError};
use crate::models::{AuditLogEntry, Case, CaseId, Decision};
use crate::store::CaseStore;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

/// Shortest accepted justification, counted after trimming.
pub const MIN_JUSTIFICATION_CHARS: usize = 10;

/// Decision request as received at the boundary.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDecision {
    pub decision: Option<String>,
    pub justification: Option<String>,
    pub officer_id: Option<String>,
    pub officer_name: Option<String>,
}

/// A decision that passed every regulatory rule.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedDecision {
    pub decision: Decision,
    pub justification: String,
    pub officer_id: String,
    pub officer_name: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct DecisionValidationError {
    pub field: &'static str,
    pub message: String,
    pub status_code: u16,
}

impl DecisionValidationError {
    fn new(field: &'static str, message: impl Into<String>, status_code: u16) -> Self {
        Self {
            field,
            message: message.into(),
            status_code,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            field: Some(self.field.to_string()),
            regulatory_requirement: true,
            ..ErrorPayload::new("validation_error", self.message.clone(), self.status_code)
        }
    }
}

pub struct DecisionGuard;

impl DecisionGuard {
    pub fn validate(raw: &RawDecision) -> Result<ValidatedDecision, DecisionValidationError> {
        let decision = match raw.decision.as_deref().map(str::trim) {
            None | Some("") => {
                return Err(DecisionValidationError::new(
                    "decision",
                    "A decision is required (approved, denied or escalated)",
                    400,
                ))
            }
            Some(value) => value.parse::<Decision>().map_err(|_| {
                DecisionValidationError::new(
                    "decision",
                    format!(
                        "Unknown decision '{}': expected approved, denied or escalated",
                        value
                    ),
                    400,
                )
            })?,
        };

        let justification = raw.justification.as_deref().unwrap_or("").trim();
        if justification.is_empty() {
            return Err(DecisionValidationError::new(
                "justification",
                "A written justification is required for every decision",
                400,
            ));
        }
        if justification.chars().count() < MIN_JUSTIFICATION_CHARS {
            return Err(DecisionValidationError::new(
                "justification",
                format!(
                    "Justification must be at least {} characters",
                    MIN_JUSTIFICATION_CHARS
                ),
                422,
            ));
        }

        let officer_id = raw.officer_id.as_deref().unwrap_or("").trim();
        if officer_id.is_empty() {
            return Err(DecisionValidationError::new(
                "officer_id",
                "Decisions must be attributed to an officer",
                401,
            ));
        }

        let officer_name = raw
            .officer_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);

        Ok(ValidatedDecision {
            decision,
            justification: justification.to_string(),
            officer_id: officer_id.to_string(),
            officer_name,
        })
    }
}

#[derive(Error, Debug)]
pub enum DecideError {
    #[error(transparent)]
    Validation(#[from] DecisionValidationError),

    #[error("Case not found: {0}")]
    NotFound(CaseId),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for DecideError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::CaseNotFound(id) => DecideError::NotFound(id),
            StoreError::InvalidTransition { case_id, from, .. } => DecideError::Conflict(format!(
                "case {} is {} and cannot be decided",
                case_id, from
            )),
            other => DecideError::Store(other),
        }
    }
}

impl DecideError {
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            DecideError::Validation(e) => e.to_payload(),
            DecideError::NotFound(_) => ErrorPayload::new("not_found", self.to_string(), 404),
            DecideError::Conflict(_) => ErrorPayload::new("conflict", self.to_string(), 409),
            DecideError::Store(_) => ErrorPayload::new("internal", self.to_string(), 500),
        }
    }
}

/// Result of a recorded decision.
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub case: Case,
    pub audit_entry: AuditLogEntry,
}

/// Validate and apply an officer's decision.
pub async fn decide(
    store: &CaseStore,
    audit: &AuditLog,
    case_id: CaseId,
    raw: &RawDecision,
) -> Result<DecisionRecord, DecideError> {
    let validated = DecisionGuard::validate(raw).map_err(|e| {
        warn!("Rejected decision for case {}: {}", case_id, e);
        e
    })?;

    let to = validated.decision.resulting_status();
    let case = store
        .update_case(case_id, |case| {
            let already_final = case.decision.is_some_and(|d| d.is_final());
            if !case.status.is_decidable() || already_final {
                return Err(StoreError::InvalidTransition {
                    case_id,
                    from: case.status,
                    to,
                });
            }

            case.status = to;
            case.decision = Some(validated.decision);
            case.decision_justification = Some(validated.justification.clone());
            case.decided_by = Some(validated.officer_id.clone());
            case.decided_at = Some(Utc::now());
            Ok(())
        })
        .await?;

    let audit_entry = audit
        .log_human_decision(
            case_id,
            &validated.officer_id,
            json!({
                "decision": validated.decision,
                "justification": validated.justification,
                "officer_name": validated.officer_name,
                "risk_score": case.risk_score,
                "risk_level": case.risk_level,
            }),
        )
        .await?;

    info!(
        "Case {} {} by {}",
        case_id, validated.decision, validated.officer_id
    );

    Ok(DecisionRecord { case, audit_entry })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActorType, Applicant, CaseStatus};
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn raw(decision: &str, justification: &str, officer_id: &str) -> RawDecision {
        RawDecision {
            decision: Some(decision.to_string()),
            justification: Some(justification.to_string()),
            officer_id: Some(officer_id.to_string()),
            officer_name: None,
        }
    }

    async fn case_in(status: CaseStatus) -> (Arc<CaseStore>, AuditLog, CaseId) {
        let store = Arc::new(CaseStore::in_memory());
        let mut case = Case::new(
            Applicant {
                full_name: "Jane Doe".to_string(),
                date_of_birth: None,
                nationality: None,
            },
            vec![],
        );
        case.status = status;
        let case = store.insert_case(case).await.unwrap();
        let audit = AuditLog::new(store.clone(), "notice");
        (store, audit, case.id)
    }

    #[test]
    fn test_justification_length_boundary() {
        let err = assert_err!(DecisionGuard::validate(&raw("approved", "123456789", "o-1")));
        assert_eq!(err.field, "justification");

        let ok = assert_ok!(DecisionGuard::validate(&raw("approved", "1234567890", "o-1")));
        assert_eq!(ok.decision, Decision::Approved);
        assert_eq!(ok.justification, "1234567890");
    }

    #[test]
    fn test_length_counts_trimmed_text() {
        let err = DecisionGuard::validate(&raw("denied", "   short    ", "o-1")).unwrap_err();
        assert_eq!(err.field, "justification");

        let err = DecisionGuard::validate(&raw("denied", "                 ", "o-1")).unwrap_err();
        assert_eq!(err.field, "justification");
        assert!(err.message.contains("required"));
    }

    #[test]
    fn test_unknown_decision_rejected() {
        let err = DecisionGuard::validate(&raw("maybe", "Looks fine to me overall", "o-1"))
            .unwrap_err();
        assert_eq!(err.field, "decision");
        assert_eq!(err.status_code, 400);

        let payload = err.to_payload();
        assert!(payload.regulatory_requirement);
        assert_eq!(payload.field.as_deref(), Some("decision"));
    }

    #[test]
    fn test_officer_required() {
        let err = DecisionGuard::validate(&raw("escalated", "Needs a second look", "  "))
            .unwrap_err();
        assert_eq!(err.field, "officer_id");

        let missing = RawDecision {
            decision: Some("approved".to_string()),
            justification: Some("All checks passed cleanly".to_string()),
            ..RawDecision::default()
        };
        assert_eq!(
            DecisionGuard::validate(&missing).unwrap_err().field,
            "officer_id"
        );
    }

    #[tokio::test]
    async fn test_decide_updates_case_and_audits_once() {
        let (store, audit, case_id) = case_in(CaseStatus::Review).await;
        let record = decide(
            &store,
            &audit,
            case_id,
            &raw("approved", "All checks passed cleanly", "officer-9"),
        )
        .await
        .unwrap();

        assert_eq!(record.case.status, CaseStatus::Approved);
        assert_eq!(record.case.decision, Some(Decision::Approved));
        assert_eq!(record.case.decided_by.as_deref(), Some("officer-9"));
        assert!(record.case.decided_at.is_some());

        let entries = audit.entries(case_id).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].actor_type, ActorType::Officer);
        assert_eq!(entries[0].action, "human_decision");
        assert_eq!(entries[0].details["decision"], "approved");
    }

    #[tokio::test]
    async fn test_decided_case_is_write_once() {
        let (store, audit, case_id) = case_in(CaseStatus::Review).await;
        decide(
            &store,
            &audit,
            case_id,
            &raw("approved", "All checks passed cleanly", "officer-1"),
        )
        .await
        .unwrap();
        let before = store.get_case(case_id).await.unwrap();

        let err = decide(
            &store,
            &audit,
            case_id,
            &raw("denied", "Changed my mind on this one", "officer-2"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DecideError::Conflict(_)));
        assert_eq!(err.to_payload().status_code, 409);

        let after = store.get_case(case_id).await.unwrap();
        assert_eq!(after, before);
        assert_eq!(audit.entries(case_id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_escalated_case_can_be_decided_again() {
        let (store, audit, case_id) = case_in(CaseStatus::Review).await;
        decide(
            &store,
            &audit,
            case_id,
            &raw("escalated", "Refer to senior compliance", "officer-1"),
        )
        .await
        .unwrap();

        let record = decide(
            &store,
            &audit,
            case_id,
            &raw("denied", "Senior review confirmed the match", "senior-1"),
        )
        .await
        .unwrap();
        assert_eq!(record.case.status, CaseStatus::Denied);
        assert_eq!(audit.entries(case_id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_pending_case_not_decidable() {
        let (store, audit, case_id) = case_in(CaseStatus::Pending).await;
        let err = decide(
            &store,
            &audit,
            case_id,
            &raw("approved", "All checks passed cleanly", "officer-1"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DecideError::Conflict(_)));
        assert!(audit.entries(case_id).await.is_empty());
    }

    #[tokio::test]
    async fn test_validation_failure_writes_nothing() {
        let (store, audit, case_id) = case_in(CaseStatus::Review).await;
        let err = decide(&store, &audit, case_id, &raw("approved", "too short", "o-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DecideError::Validation(_)));
        assert_eq!(store.get_case(case_id).await.unwrap().status, CaseStatus::Review);
        assert!(audit.entries(case_id).await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_case() {
        let (store, audit, _) = case_in(CaseStatus::Review).await;
        let err = decide(
            &store,
            &audit,
            uuid::Uuid::new_v4(),
            &raw("approved", "All checks passed cleanly", "officer-1"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DecideError::NotFound(_)));
    }
}
