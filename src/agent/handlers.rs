//! Built-in agent handlers.
//!
//! These are deterministic rule-based stand-ins for the five analysis agents.
//! Each one accepts an [`AgentInput`] and either returns its own findings or
//! an error, which the harness turns into a failed result.

use crate::agent::harness::Scored;
use crate::models::{AgentType, Applicant, CaseId, Document, RiskLevel};
use anyhow::{bail, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Typed input handed to every agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInput {
    pub case_id: CaseId,
    pub applicant: Applicant,
    pub documents: Vec<Document>,
    /// Completed upstream results this agent depends on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstream: Vec<UpstreamResult>,
}

impl AgentInput {
    /// Output of the given upstream agent, if it was supplied.
    pub fn upstream(&self, agent_type: AgentType) -> Option<&AgentOutput> {
        self.upstream
            .iter()
            .find(|u| u.agent_type == agent_type)
            .map(|u| &u.output)
    }
}

/// A completed upstream run, as seen by a dependent agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamResult {
    pub agent_type: AgentType,
    pub run_id: Uuid,
    pub confidence: Option<f64>,
    pub output: AgentOutput,
}

/// Success payload of any agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentOutput {
    Documents(DocumentFindings),
    Identity(IdentityFindings),
    Sanctions(SanctionsFindings),
    Risk(RiskAssessment),
    Narrative(CaseNarrative),
}

impl Scored for AgentOutput {
    fn confidence(&self) -> f64 {
        match self {
            AgentOutput::Documents(f) => f.confidence,
            AgentOutput::Identity(f) => f.confidence,
            AgentOutput::Sanctions(f) => f.confidence,
            AgentOutput::Risk(f) => f.confidence,
            AgentOutput::Narrative(f) => f.confidence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Passport,
    DrivingLicence,
    NationalId,
    ProofOfAddress,
    Unknown,
}

impl DocumentKind {
    /// Classifies a document from its file name.
    pub fn classify(file_name: &str) -> Self {
        let name = file_name.to_lowercase();
        if name.contains("passport") {
            DocumentKind::Passport
        } else if name.contains("licence") || name.contains("license") {
            DocumentKind::DrivingLicence
        } else if name.contains("national") || name.contains("id_card") || name.contains("id-card")
        {
            DocumentKind::NationalId
        } else if name.contains("utility") || name.contains("bank") || name.contains("address") {
            DocumentKind::ProofOfAddress
        } else {
            DocumentKind::Unknown
        }
    }

    pub fn is_photo_id(&self) -> bool {
        matches!(
            self,
            DocumentKind::Passport | DocumentKind::DrivingLicence | DocumentKind::NationalId
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub document_id: Uuid,
    pub file_name: String,
    pub kind: DocumentKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentFindings {
    pub documents: Vec<ExtractedDocument>,
    pub has_photo_id: bool,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityCheck {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityFindings {
    pub verified: bool,
    pub checks: Vec<IdentityCheck>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanctionsFindings {
    pub clear: bool,
    pub hits: Vec<String>,
    pub entries_screened: usize,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub code: String,
    pub weight: f64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub requires_manual_review: bool,
    pub factors: Vec<RiskFactor>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseNarrative {
    pub summary: String,
    pub confidence: f64,
}

/// Classifies uploaded documents.
#[derive(Debug, Clone, Default)]
pub struct DocumentProcessor;

impl DocumentProcessor {
    pub fn process(&self, input: &AgentInput) -> Result<DocumentFindings> {
        if input.documents.is_empty() {
            bail!("no documents to process");
        }

        let mut documents = Vec::with_capacity(input.documents.len());
        for doc in &input.documents {
            if doc.size_bytes == 0 {
                bail!("document {} is empty or unreadable", doc.file_name);
            }
            documents.push(ExtractedDocument {
                document_id: doc.id,
                file_name: doc.file_name.clone(),
                kind: DocumentKind::classify(&doc.file_name),
            });
        }

        let classified = documents
            .iter()
            .filter(|d| d.kind != DocumentKind::Unknown)
            .count();
        let has_photo_id = documents.iter().any(|d| d.kind.is_photo_id());
        let confidence = 0.5 + 0.45 * (classified as f64 / documents.len() as f64);

        Ok(DocumentFindings {
            documents,
            has_photo_id,
            confidence,
        })
    }
}

/// Checks the applicant's identity fields.
#[derive(Debug, Clone)]
pub struct IdentityVerifier {
    pub minimum_age: u32,
}

impl Default for IdentityVerifier {
    fn default() -> Self {
        Self { minimum_age: 18 }
    }
}

impl IdentityVerifier {
    pub fn verify(&self, input: &AgentInput) -> Result<IdentityFindings> {
        let applicant = &input.applicant;
        if applicant.full_name.trim().is_empty() {
            bail!("applicant name is missing");
        }

        let mut checks = vec![IdentityCheck {
            name: "full_name".to_string(),
            passed: true,
            detail: None,
        }];

        checks.push(match applicant.date_of_birth {
            Some(dob) => {
                let today = Utc::now().date_naive();
                match today.years_since(dob) {
                    Some(age) if age >= self.minimum_age => IdentityCheck {
                        name: "date_of_birth".to_string(),
                        passed: true,
                        detail: None,
                    },
                    Some(age) => IdentityCheck {
                        name: "date_of_birth".to_string(),
                        passed: false,
                        detail: Some(format!(
                            "applicant is {} years old, minimum is {}",
                            age, self.minimum_age
                        )),
                    },
                    None => IdentityCheck {
                        name: "date_of_birth".to_string(),
                        passed: false,
                        detail: Some("date of birth is in the future".to_string()),
                    },
                }
            }
            None => IdentityCheck {
                name: "date_of_birth".to_string(),
                passed: false,
                detail: Some("date of birth not provided".to_string()),
            },
        });

        let nationality_present = applicant
            .nationality
            .as_deref()
            .is_some_and(|n| !n.trim().is_empty());
        checks.push(IdentityCheck {
            name: "nationality".to_string(),
            passed: nationality_present,
            detail: (!nationality_present).then(|| "nationality not provided".to_string()),
        });

        let passed = checks.iter().filter(|c| c.passed).count();
        let confidence = passed as f64 / checks.len() as f64;

        Ok(IdentityFindings {
            verified: passed == checks.len(),
            checks,
            confidence,
        })
    }
}

/// Exact-name screening against a configured watchlist.
#[derive(Debug, Clone, Default)]
pub struct SanctionsScreener {
    pub watchlist: Vec<String>,
}

impl SanctionsScreener {
    pub fn screen(&self, input: &AgentInput) -> Result<SanctionsFindings> {
        let name = normalize_name(&input.applicant.full_name);
        if name.is_empty() {
            bail!("cannot screen an applicant without a name");
        }

        let hits: Vec<String> = self
            .watchlist
            .iter()
            .filter(|entry| normalize_name(entry) == name)
            .cloned()
            .collect();

        let confidence = if self.watchlist.is_empty() { 0.5 } else { 0.95 };

        Ok(SanctionsFindings {
            clear: hits.is_empty(),
            hits,
            entries_screened: self.watchlist.len(),
            confidence,
        })
    }
}

fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Combines upstream findings into a risk score.
#[derive(Debug, Clone)]
pub struct RiskScorer {
    pub review_threshold: f64,
}

impl Default for RiskScorer {
    fn default() -> Self {
        Self {
            review_threshold: 50.0,
        }
    }
}

impl RiskScorer {
    pub fn score(&self, input: &AgentInput) -> Result<RiskAssessment> {
        let documents = match input.upstream(AgentType::DocumentProcessor) {
            Some(AgentOutput::Documents(f)) => Some(f),
            _ => None,
        };
        let identity = match input.upstream(AgentType::IdentityVerifier) {
            Some(AgentOutput::Identity(f)) => Some(f),
            _ => None,
        };
        let sanctions = match input.upstream(AgentType::SanctionsScreener) {
            Some(AgentOutput::Sanctions(f)) => Some(f),
            _ => None,
        };

        if documents.is_none() && identity.is_none() && sanctions.is_none() {
            bail!("no upstream results");
        }

        let mut factors = Vec::new();
        let mut add = |code: &str, weight: f64, description: String| {
            factors.push(RiskFactor {
                code: code.to_string(),
                weight,
                description,
            });
        };

        match documents {
            None => add(
                "documents_unavailable",
                15.0,
                "document processing did not complete".to_string(),
            ),
            Some(f) if !f.has_photo_id => add(
                "no_photo_id",
                15.0,
                "no photo identification document was supplied".to_string(),
            ),
            Some(_) => {}
        }

        match identity {
            None => add(
                "identity_unavailable",
                15.0,
                "identity verification did not complete".to_string(),
            ),
            Some(f) if !f.verified => {
                let failed: Vec<&str> = f
                    .checks
                    .iter()
                    .filter(|c| !c.passed)
                    .map(|c| c.name.as_str())
                    .collect();
                add(
                    "identity_unverified",
                    30.0,
                    format!("identity checks failed: {}", failed.join(", ")),
                );
            }
            Some(_) => {}
        }

        let sanctions_hit = match sanctions {
            None => {
                add(
                    "screening_unavailable",
                    20.0,
                    "sanctions screening did not complete".to_string(),
                );
                false
            }
            Some(f) if !f.clear => {
                add(
                    "sanctions_match",
                    60.0,
                    format!("watchlist match: {}", f.hits.join(", ")),
                );
                true
            }
            Some(_) => false,
        };

        let missing_upstream = [documents.is_none(), identity.is_none(), sanctions.is_none()]
            .iter()
            .filter(|missing| **missing)
            .count();

        let risk_score = (10.0 + factors.iter().map(|f| f.weight).sum::<f64>()).min(100.0);
        let requires_manual_review =
            risk_score >= self.review_threshold || sanctions_hit || missing_upstream > 0;

        Ok(RiskAssessment {
            risk_score,
            risk_level: RiskLevel::from_score(risk_score),
            requires_manual_review,
            factors,
            confidence: (3 - missing_upstream) as f64 / 3.0,
        })
    }
}

/// Writes the case summary an officer reads before deciding.
#[derive(Debug, Clone, Default)]
pub struct CaseNarrator;

impl CaseNarrator {
    pub fn narrate(&self, input: &AgentInput) -> Result<CaseNarrative> {
        let risk = match input.upstream(AgentType::RiskScorer) {
            Some(AgentOutput::Risk(r)) => r,
            _ => bail!("risk assessment unavailable"),
        };

        let mut summary = format!(
            "Applicant {} was assessed as {} risk with a score of {:.0}/100.",
            input.applicant.full_name.trim(),
            risk.risk_level,
            risk.risk_score
        );

        if risk.factors.is_empty() {
            summary.push_str(" No risk factors were identified.");
        } else {
            summary.push_str(" Contributing factors:");
            for factor in &risk.factors {
                summary.push_str(&format!(" {} (+{:.0});", factor.description, factor.weight));
            }
        }

        if risk.requires_manual_review {
            summary.push_str(" Manual review is required before a decision.");
        } else {
            summary.push_str(" No automated concerns; officer sign-off is still required.");
        }

        Ok(CaseNarrative {
            summary,
            confidence: 0.9,
        })
    }
}
