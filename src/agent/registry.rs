//! Agent registry.
//!
//! Maps each agent type to its handler and execution settings. The set of
//! handlers is closed: [`AgentHandler`] has exactly one variant per agent
//! type. Re-registering a type replaces the previous entry, which is how a
//! placeholder handler is swapped for a real one without touching callers.

use crate::agent::handlers::{
    AgentInput, AgentOutput, CaseNarrator, DocumentProcessor, IdentityVerifier, RiskScorer,
    SanctionsScreener,
};
use crate::config::{AgentSettings, Config};
use crate::error::UnregisteredAgentError;
use crate::models::AgentType;
use anyhow::Result;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// One handler per agent type.
#[derive(Debug, Clone)]
pub enum AgentHandler {
    DocumentProcessor(DocumentProcessor),
    IdentityVerifier(IdentityVerifier),
    SanctionsScreener(SanctionsScreener),
    RiskScorer(RiskScorer),
    CaseNarrator(CaseNarrator),
    /// Sleeps past any sensible timeout, then fails.
    #[cfg(test)]
    Stalled(AgentType, std::time::Duration),
}

impl AgentHandler {
    /// The agent type this handler implements.
    pub fn agent_type(&self) -> AgentType {
        match self {
            AgentHandler::DocumentProcessor(_) => AgentType::DocumentProcessor,
            AgentHandler::IdentityVerifier(_) => AgentType::IdentityVerifier,
            AgentHandler::SanctionsScreener(_) => AgentType::SanctionsScreener,
            AgentHandler::RiskScorer(_) => AgentType::RiskScorer,
            AgentHandler::CaseNarrator(_) => AgentType::CaseNarrator,
            #[cfg(test)]
            AgentHandler::Stalled(agent_type, _) => *agent_type,
        }
    }

    /// Execute the handler against one input.
    pub async fn handle(&self, input: AgentInput) -> Result<AgentOutput> {
        tokio::task::yield_now().await;

        match self {
            AgentHandler::DocumentProcessor(h) => h.process(&input).map(AgentOutput::Documents),
            AgentHandler::IdentityVerifier(h) => h.verify(&input).map(AgentOutput::Identity),
            AgentHandler::SanctionsScreener(h) => h.screen(&input).map(AgentOutput::Sanctions),
            AgentHandler::RiskScorer(h) => h.score(&input).map(AgentOutput::Risk),
            AgentHandler::CaseNarrator(h) => h.narrate(&input).map(AgentOutput::Narrative),
            #[cfg(test)]
            AgentHandler::Stalled(agent_type, delay) => {
                tokio::time::sleep(*delay).await;
                anyhow::bail!("{} stalled for {:?}", agent_type, delay)
            }
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a {handler} handler cannot be registered as {requested}")]
    HandlerMismatch {
        requested: AgentType,
        handler: AgentType,
    },
}

/// A resolved registry entry.
#[derive(Debug, Clone)]
pub struct RegisteredAgent {
    pub handler: AgentHandler,
    pub config: AgentSettings,
}

#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<AgentType, RegisteredAgent>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handler for every agent type.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        let builtins = [
            AgentHandler::DocumentProcessor(DocumentProcessor),
            AgentHandler::IdentityVerifier(IdentityVerifier {
                minimum_age: config.risk.minimum_age,
            }),
            AgentHandler::SanctionsScreener(SanctionsScreener {
                watchlist: config.screening.watchlist.clone(),
            }),
            AgentHandler::RiskScorer(RiskScorer {
                review_threshold: config.risk.review_threshold,
            }),
            AgentHandler::CaseNarrator(CaseNarrator),
        ];

        for handler in builtins {
            let agent_type = handler.agent_type();
            let settings = config.agents.for_agent(agent_type).clone();
            if let Err(e) = registry.register(agent_type, handler, settings) {
                warn!("Skipping built-in agent: {}", e);
            }
        }

        info!("Registered {} built-in agents", registry.agents.len());
        registry
    }

    /// Register or replace the handler for an agent type.
    pub fn register(
        &mut self,
        agent_type: AgentType,
        handler: AgentHandler,
        config: AgentSettings,
    ) -> Result<(), RegistryError> {
        if handler.agent_type() != agent_type {
            return Err(RegistryError::HandlerMismatch {
                requested: agent_type,
                handler: handler.agent_type(),
            });
        }

        if self
            .agents
            .insert(agent_type, RegisteredAgent { handler, config })
            .is_some()
        {
            debug!("Replaced handler for {}", agent_type);
        }

        Ok(())
    }

    pub fn resolve(&self, agent_type: AgentType) -> Result<&RegisteredAgent, UnregisteredAgentError> {
        self.agents
            .get(&agent_type)
            .ok_or(UnregisteredAgentError(agent_type))
    }

    /// Fails on the first agent type without a registration.
    pub fn ensure_complete(&self) -> Result<(), UnregisteredAgentError> {
        for agent_type in AgentType::ALL {
            self.resolve(agent_type)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Applicant;
    use uuid::Uuid;

    #[test]
    fn test_builtins_cover_every_agent() {
        let registry = AgentRegistry::from_config(&Config::default());
        assert!(registry.ensure_complete().is_ok());

        let entry = registry.resolve(AgentType::DocumentProcessor).unwrap();
        assert_eq!(entry.handler.agent_type(), AgentType::DocumentProcessor);
        assert_eq!(entry.config.retry_count, 1);
    }

    #[test]
    fn test_unregistered_agent() {
        let mut registry = AgentRegistry::new();
        registry
            .register(
                AgentType::CaseNarrator,
                AgentHandler::CaseNarrator(CaseNarrator),
                AgentSettings::default(),
            )
            .unwrap();

        let err = registry.resolve(AgentType::RiskScorer).unwrap_err();
        assert_eq!(err, UnregisteredAgentError(AgentType::RiskScorer));
        assert_eq!(
            registry.ensure_complete().unwrap_err(),
            UnregisteredAgentError(AgentType::DocumentProcessor)
        );
    }

    #[test]
    fn test_register_rejects_mismatched_handler() {
        let mut registry = AgentRegistry::new();
        let err = registry
            .register(
                AgentType::RiskScorer,
                AgentHandler::CaseNarrator(CaseNarrator),
                AgentSettings::default(),
            )
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::HandlerMismatch {
                requested: AgentType::RiskScorer,
                handler: AgentType::CaseNarrator,
            }
        );
    }

    #[tokio::test]
    async fn test_reregistration_replaces_handler() {
        let mut registry = AgentRegistry::from_config(&Config::default());
        let settings = AgentSettings {
            timeout_ms: 10,
            ..AgentSettings::default()
        };
        registry
            .register(
                AgentType::SanctionsScreener,
                AgentHandler::SanctionsScreener(SanctionsScreener {
                    watchlist: vec!["Jane Doe".to_string()],
                }),
                settings.clone(),
            )
            .unwrap();

        let entry = registry.resolve(AgentType::SanctionsScreener).unwrap();
        assert_eq!(entry.config, settings);

        let input = AgentInput {
            case_id: Uuid::new_v4(),
            applicant: Applicant {
                full_name: "Jane Doe".to_string(),
                date_of_birth: None,
                nationality: None,
            },
            documents: vec![],
            upstream: vec![],
        };
        match entry.handler.handle(input).await.unwrap() {
            AgentOutput::Sanctions(findings) => assert!(!findings.clear),
            other => panic!("unexpected output: {:?}", other),
        }
    }
}
