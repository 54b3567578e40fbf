//! Uniform execution of a single agent invocation.
//!
//! The harness times the handler, applies the per-attempt timeout and the
//! retry budget, and always hands back an [`AgentResult`]. Handler errors,
//! timeouts and panics are converted into `success: false` results so the
//! coordinator can branch on a value.

use crate::config::AgentSettings;
use crate::models::{AgentResult, AgentType};
use futures::FutureExt;
use serde_json::{json, Value};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Payloads that report how confident the producing agent was.
pub trait Scored {
    /// Confidence in `[0, 1]`.
    fn confidence(&self) -> f64;
}

/// Run one agent invocation and normalise its outcome.
///
/// The handler may be invoked up to `retry_count + 1` times, each attempt
/// bounded by `timeout_ms`. No persistence happens here.
pub async fn run<I, T, F, Fut>(
    agent_type: AgentType,
    input: I,
    config: &AgentSettings,
    handler: F,
) -> AgentResult<T>
where
    I: Clone,
    T: Scored,
    F: Fn(I) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let started = Instant::now();
    let timeout = Duration::from_millis(config.timeout_ms);
    let max_attempts = config.retry_count + 1;

    let mut last_error = String::new();
    let mut timed_out = false;

    for attempt in 1..=max_attempts {
        let attempt_future = AssertUnwindSafe(handler(input.clone())).catch_unwind();

        match tokio::time::timeout(timeout, attempt_future).await {
            Ok(Ok(Ok(data))) => {
                let confidence = data.confidence().clamp(0.0, 1.0);
                let mut result =
                    AgentResult::succeeded(agent_type, data, confidence, elapsed_ms(started));
                result
                    .metadata
                    .insert("attempts".to_string(), json!(attempt));

                if confidence < config.min_confidence {
                    warn!(
                        "{} confidence {:.2} is below the configured floor {:.2}",
                        agent_type, confidence, config.min_confidence
                    );
                    result
                        .metadata
                        .insert("below_min_confidence".to_string(), Value::Bool(true));
                }

                debug!(
                    "{} succeeded on attempt {} in {}ms",
                    agent_type, attempt, result.duration_ms
                );
                return result;
            }
            Ok(Ok(Err(e))) => {
                timed_out = false;
                last_error = format!("{:#}", e);
            }
            Ok(Err(panic)) => {
                timed_out = false;
                last_error = format!("agent panicked: {}", panic_message(panic.as_ref()));
            }
            Err(_) => {
                timed_out = true;
                last_error = format!("{} timed out after {}ms", agent_type, config.timeout_ms);
            }
        }

        warn!(
            "{} attempt {}/{} failed: {}",
            agent_type, attempt, max_attempts, last_error
        );
    }

    let mut result = AgentResult::failed(agent_type, last_error, elapsed_ms(started));
    result
        .metadata
        .insert("attempts".to_string(), json!(max_attempts));
    result
        .metadata
        .insert("timed_out".to_string(), Value::Bool(timed_out));
    result
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    struct Probe(f64);

    impl Scored for Probe {
        fn confidence(&self) -> f64 {
            self.0
        }
    }

    fn settings(timeout_ms: u64, retry_count: u32) -> AgentSettings {
        AgentSettings {
            timeout_ms,
            min_confidence: 0.5,
            retry_count,
        }
    }

    #[tokio::test]
    async fn test_success_envelope() {
        let result = run(
            AgentType::IdentityVerifier,
            0.8,
            &settings(1_000, 0),
            |c: f64| async move { Ok::<_, anyhow::Error>(Probe(c)) },
        )
        .await;

        assert!(result.success);
        assert_eq!(result.data, Some(Probe(0.8)));
        assert_eq!(result.confidence, 0.8);
        assert!(result.error.is_none());
        assert_eq!(result.agent_type, AgentType::IdentityVerifier);
        assert_eq!(result.metadata["attempts"], json!(1));
        assert!(!result.metadata.contains_key("below_min_confidence"));
    }

    #[tokio::test]
    async fn test_error_becomes_failed_result() {
        let result: AgentResult<Probe> = run(
            AgentType::DocumentProcessor,
            (),
            &settings(1_000, 0),
            |_| async { Err(anyhow::anyhow!("document is unreadable")) },
        )
        .await;

        assert!(!result.success);
        assert!(result.data.is_none());
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.error.as_deref(), Some("document is unreadable"));
        assert_eq!(result.metadata["timed_out"], json!(false));
    }

    #[tokio::test]
    async fn test_timeout_becomes_failed_result() {
        let result: AgentResult<Probe> = run(
            AgentType::SanctionsScreener,
            (),
            &settings(20, 0),
            |_| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, anyhow::Error>(Probe(1.0))
            },
        )
        .await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out after 20ms"));
        assert_eq!(result.metadata["timed_out"], json!(true));
        assert!(result.duration_ms < 500);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));

        let result = run(AgentType::RiskScorer, (), &settings(1_000, 2), |_| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("transient failure");
                }
                Ok(Probe(0.9))
            }
        })
        .await;

        assert!(result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.metadata["attempts"], json!(2));
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: AgentResult<Probe> =
            run(AgentType::CaseNarrator, (), &settings(1_000, 1), |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("still broken")
                }
            })
            .await;

        assert!(!result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.metadata["attempts"], json!(2));
    }

    #[tokio::test]
    async fn test_low_confidence_is_flagged_not_failed() {
        let result = run(
            AgentType::DocumentProcessor,
            (),
            &settings(1_000, 0),
            |_| async { Ok::<_, anyhow::Error>(Probe(0.2)) },
        )
        .await;

        assert!(result.success);
        assert_eq!(result.metadata["below_min_confidence"], json!(true));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let result: AgentResult<Probe> = run(
            AgentType::IdentityVerifier,
            true,
            &settings(1_000, 0),
            |explode: bool| async move {
                if explode {
                    panic!("registry corrupted");
                }
                Ok::<_, anyhow::Error>(Probe(1.0))
            },
        )
        .await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("registry corrupted"));
    }
}
