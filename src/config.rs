//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.caseflow.toml` files.

use crate::models::AgentType;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = ".caseflow.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Progress stream settings.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Per-agent execution settings.
    #[serde(default)]
    pub agents: AgentsConfig,

    /// Sanctions screening settings.
    #[serde(default)]
    pub screening: ScreeningConfig,

    /// Risk scoring settings.
    #[serde(default)]
    pub risk: RiskConfig,

    /// Audit export settings.
    #[serde(default)]
    pub audit: AuditConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Where cases, agent runs and audit entries are persisted.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            verbose: false,
        }
    }
}

fn default_state_file() -> PathBuf {
    PathBuf::from(".caseflow/state.json")
}

/// Progress stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Delay between the terminal event and stream closure.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

fn default_grace_period_ms() -> u64 {
    500
}

/// Recognised options for a single agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Per-attempt timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Confidence below this is flagged in the result metadata.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Extra attempts after a failed or timed-out one.
    #[serde(default)]
    pub retry_count: u32,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            min_confidence: default_min_confidence(),
            retry_count: 0,
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_min_confidence() -> f64 {
    0.5
}

/// Settings for every agent type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_document_processor")]
    pub document_processor: AgentSettings,
    #[serde(default)]
    pub identity_verifier: AgentSettings,
    #[serde(default)]
    pub sanctions_screener: AgentSettings,
    #[serde(default)]
    pub risk_scorer: AgentSettings,
    #[serde(default)]
    pub case_narrator: AgentSettings,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            document_processor: default_document_processor(),
            identity_verifier: AgentSettings::default(),
            sanctions_screener: AgentSettings::default(),
            risk_scorer: AgentSettings::default(),
            case_narrator: AgentSettings::default(),
        }
    }
}

// Document extraction retries once unless configured otherwise.
fn default_document_processor() -> AgentSettings {
    AgentSettings {
        retry_count: 1,
        ..AgentSettings::default()
    }
}

impl AgentsConfig {
    pub fn for_agent(&self, agent_type: AgentType) -> &AgentSettings {
        match agent_type {
            AgentType::DocumentProcessor => &self.document_processor,
            AgentType::IdentityVerifier => &self.identity_verifier,
            AgentType::SanctionsScreener => &self.sanctions_screener,
            AgentType::RiskScorer => &self.risk_scorer,
            AgentType::CaseNarrator => &self.case_narrator,
        }
    }
}

/// Sanctions screening settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScreeningConfig {
    /// Names screened against, compared case- and whitespace-insensitively.
    #[serde(default)]
    pub watchlist: Vec<String>,
}

/// Risk scoring settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Scores at or above this require manual review.
    #[serde(default = "default_review_threshold")]
    pub review_threshold: f64,

    /// Applicants younger than this fail identity verification.
    #[serde(default = "default_minimum_age")]
    pub minimum_age: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            review_threshold: default_review_threshold(),
            minimum_age: default_minimum_age(),
        }
    }
}

fn default_review_threshold() -> f64 {
    50.0
}

fn default_minimum_age() -> u32 {
    18
}

/// Audit export settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Text of the comment row leading every export.
    #[serde(default = "default_regulatory_notice")]
    pub regulatory_notice: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            regulatory_notice: default_regulatory_notice(),
        }
    }
}

fn default_regulatory_notice() -> String {
    "Regulatory audit record. Retain for a minimum of 5 years. Do not modify.".to_string()
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE_NAME);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    /// This method only overrides config when CLI provides explicit values.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref state_file) = args.state_file {
            self.general.state_file = state_file.clone();
        }

        if let Some(grace) = args.grace_period_ms {
            self.stream.grace_period_ms = grace;
        }

        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.stream.grace_period_ms, 500);
        assert_eq!(config.agents.document_processor.retry_count, 1);
        assert_eq!(config.agents.risk_scorer.retry_count, 0);
        assert_eq!(config.agents.case_narrator.timeout_ms, 30_000);
        assert_eq!(config.risk.review_threshold, 50.0);
        assert!(config.screening.watchlist.is_empty());
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[general]
state_file = "/tmp/cases.json"
verbose = true

[stream]
grace_period_ms = 50

[agents.sanctions_screener]
timeout_ms = 1200
retry_count = 2

[screening]
watchlist = ["Ivan Petrov", "Jane Roe"]
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.general.state_file, PathBuf::from("/tmp/cases.json"));
        assert!(config.general.verbose);
        assert_eq!(config.stream.grace_period_ms, 50);

        let screener = config.agents.for_agent(AgentType::SanctionsScreener);
        assert_eq!(screener.timeout_ms, 1200);
        assert_eq!(screener.retry_count, 2);
        assert_eq!(screener.min_confidence, 0.5);

        // Untouched sections keep their defaults.
        assert_eq!(config.agents.document_processor.retry_count, 1);
        assert_eq!(config.screening.watchlist.len(), 2);
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(!toml_str.is_empty());
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[stream]"));
        assert!(toml_str.contains("[agents.document_processor]"));

        let reparsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(reparsed.risk.minimum_age, 18);
    }
}
