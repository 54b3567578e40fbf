//! Append-only audit trail and CSV export.
//!
//! Every material event (agent outcome, pipeline transition, human decision,
//! export) becomes one immutable [`AuditLogEntry`]. There is no update or
//! delete path. System events are best-effort: a failed write is logged and
//! swallowed so it cannot abort the operation it annotates. Human decisions
//! and exports propagate write failures.

use crate::error::{ErrorPayload, StoreError};
use crate::models::{ActorType, AgentResult, AuditLogEntry, CaseId};
use crate::store::CaseStore;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Fixed column set of the export.
pub const CSV_HEADER: &str = "timestamp,case_id,actor_type,actor_id,action,details";

const SYSTEM_ACTOR: &str = "system";

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("No audit entries found for case {0}")]
    NoEntries(CaseId),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl AuditError {
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            AuditError::NoEntries(_) => ErrorPayload::new("not_found", self.to_string(), 404),
            AuditError::Store(_) => ErrorPayload::new("internal", self.to_string(), 500),
        }
    }
}

#[derive(Clone)]
pub struct AuditLog {
    store: Arc<CaseStore>,
    regulatory_notice: String,
}

impl AuditLog {
    pub fn new(store: Arc<CaseStore>, regulatory_notice: impl Into<String>) -> Self {
        Self {
            store,
            regulatory_notice: regulatory_notice.into(),
        }
    }

    async fn append(
        &self,
        case_id: CaseId,
        actor_type: ActorType,
        actor_id: &str,
        action: &str,
        details: Value,
    ) -> Result<AuditLogEntry, StoreError> {
        let entry = AuditLogEntry {
            id: Uuid::new_v4(),
            case_id,
            actor_type,
            actor_id: actor_id.to_string(),
            action: action.to_string(),
            details,
            created_at: Utc::now(),
        };
        self.store.append_audit(entry.clone()).await?;
        debug!("Audit {} for case {}", action, case_id);
        Ok(entry)
    }

    /// Best-effort system event.
    pub async fn log_system_event(&self, case_id: CaseId, action: &str, details: Value) {
        if let Err(e) = self
            .append(case_id, ActorType::System, SYSTEM_ACTOR, action, details)
            .await
        {
            warn!("Failed to record audit event {} for {}: {}", action, case_id, e);
        }
    }

    /// Best-effort record of one agent outcome.
    pub async fn log_agent_outcome<T>(&self, case_id: CaseId, run_id: Uuid, result: &AgentResult<T>) {
        let action = if result.success {
            "agent_completed"
        } else {
            "agent_failed"
        };
        let details = json!({
            "run_id": run_id,
            "confidence": result.confidence,
            "duration_ms": result.duration_ms,
            "error": result.error,
            "metadata": result.metadata,
        });

        if let Err(e) = self
            .append(
                case_id,
                ActorType::Agent,
                result.agent_type.as_str(),
                action,
                details,
            )
            .await
        {
            warn!(
                "Failed to record {} outcome for {}: {}",
                result.agent_type, case_id, e
            );
        }
    }

    /// Record an officer's decision. Failures propagate.
    pub async fn log_human_decision(
        &self,
        case_id: CaseId,
        officer_id: &str,
        details: Value,
    ) -> Result<AuditLogEntry, StoreError> {
        self.append(case_id, ActorType::Officer, officer_id, "human_decision", details)
            .await
    }

    pub async fn entries(&self, case_id: CaseId) -> Vec<AuditLogEntry> {
        self.store.audit_entries(case_id).await
    }

    /// Export the case's audit trail as CSV and record the export itself.
    pub async fn export_csv(&self, case_id: CaseId, requested_by: &str) -> Result<String, AuditError> {
        let entries = self.entries(case_id).await;
        if entries.is_empty() {
            return Err(AuditError::NoEntries(case_id));
        }

        let document = render_csv(&self.regulatory_notice, &entries);

        self.append(
            case_id,
            ActorType::Officer,
            requested_by,
            "audit_exported",
            json!({ "format": "csv", "entries": entries.len() }),
        )
        .await?;

        Ok(document)
    }
}

/// Render entries as CSV: a comment row, the header row, one row per entry.
pub fn render_csv(notice: &str, entries: &[AuditLogEntry]) -> String {
    let mut out = String::new();

    out.push_str("# ");
    out.push_str(&notice.replace(['\r', '\n'], " "));
    out.push('\n');
    out.push_str(CSV_HEADER);
    out.push('\n');

    for entry in entries {
        let details = serde_json::to_string(&entry.details).unwrap_or_default();
        let row = [
            entry.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            entry.case_id.to_string(),
            entry.actor_type.as_str().to_string(),
            entry.actor_id.clone(),
            entry.action.clone(),
            details,
        ];

        let cells: Vec<String> = row.iter().map(|v| csv_field(v)).collect();
        out.push_str(&cells.join(","));
        out.push('\n');
    }

    out
}

/// Quote a value so delimiters, quotes and newlines stay inside the cell.
/// Leading formula characters are neutralised for spreadsheet tools.
fn csv_field(value: &str) -> String {
    let guarded = match value.chars().next() {
        Some('=' | '+' | '-' | '@') => format!("'{}", value),
        _ => value.to_string(),
    };
    format!("\"{}\"", guarded.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentType, Applicant, Case};

    async fn setup() -> (AuditLog, CaseId) {
        let store = Arc::new(CaseStore::in_memory());
        let case = store
            .insert_case(Case::new(
                Applicant {
                    full_name: "Jane Doe".to_string(),
                    date_of_birth: None,
                    nationality: None,
                },
                vec![],
            ))
            .await
            .unwrap();
        (AuditLog::new(store, "Retain for 5 years"), case.id)
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "\"plain\"");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("=SUM(A1)"), "\"'=SUM(A1)\"");
        assert_eq!(csv_field("line\nbreak"), "\"line\nbreak\"");
    }

    #[tokio::test]
    async fn test_entries_are_append_only_and_ordered() {
        let (audit, case_id) = setup().await;

        let mut last_count = 0;
        for action in ["case_created", "pipeline_started", "pipeline_completed"] {
            audit.log_system_event(case_id, action, json!({})).await;
            let count = audit.entries(case_id).await.len();
            assert!(count > last_count);
            last_count = count;
        }

        let actions: Vec<String> = audit
            .entries(case_id)
            .await
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec!["case_created", "pipeline_started", "pipeline_completed"]
        );
    }

    #[tokio::test]
    async fn test_system_event_failure_is_swallowed() {
        let (audit, _) = setup().await;
        // Unknown case: the write fails but nothing is raised.
        audit
            .log_system_event(Uuid::new_v4(), "orphan", json!({}))
            .await;
    }

    #[tokio::test]
    async fn test_agent_outcome_entry() {
        let (audit, case_id) = setup().await;
        let result: AgentResult<()> = AgentResult::failed(AgentType::IdentityVerifier, "missing", 7);
        audit.log_agent_outcome(case_id, Uuid::new_v4(), &result).await;

        let entries = audit.entries(case_id).await;
        assert_eq!(entries[0].actor_type, ActorType::Agent);
        assert_eq!(entries[0].actor_id, "identity_verifier");
        assert_eq!(entries[0].action, "agent_failed");
        assert_eq!(entries[0].details["error"], "missing");
    }

    #[tokio::test]
    async fn test_export_requires_entries() {
        let (audit, case_id) = setup().await;
        let err = audit.export_csv(case_id, "officer-1").await.unwrap_err();
        assert!(matches!(err, AuditError::NoEntries(_)));
        assert_eq!(err.to_payload().status_code, 404);
    }

    #[tokio::test]
    async fn test_export_format_and_meta_audit() {
        let (audit, case_id) = setup().await;
        audit
            .log_human_decision(
                case_id,
                "officer-7",
                json!({ "decision": "denied", "justification": "Name matches, see \"list A\", row 4" }),
            )
            .await
            .unwrap();

        let csv = audit.export_csv(case_id, "officer-7").await.unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "# Retain for 5 years");
        assert_eq!(lines[1], CSV_HEADER);
        assert_eq!(lines.len(), 3);
        assert!(lines[2].contains("\"officer\",\"officer-7\",\"human_decision\""));
        assert!(lines[2].contains(r#"see \""list A\"", row 4"#));

        // The export recorded itself; the next export includes that entry.
        let entries = audit.entries(case_id).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].action, "audit_exported");
        assert_eq!(entries[1].details["entries"], 1);

        let second = audit.export_csv(case_id, "officer-7").await.unwrap();
        assert_eq!(second.lines().count(), 4);
    }
}
