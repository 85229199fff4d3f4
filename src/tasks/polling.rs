use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::{
    ai::{AnalysisGateway, AnalysisStatus},
    config::PipelineConfig,
    domain::AnalysisResult,
    infrastructure::trigger::TriggerListener,
};

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            interval: config.poll_interval,
            max_attempts: config.max_poll_attempts,
        }
    }

    /// Wall-clock ceiling for one polled analysis.
    pub fn ceiling(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed(AnalysisResult),
    Failed(String),
    TimedOut { attempts: u32 },
    Cancelled,
}

/// Waits for an asynchronous analysis job to resolve.
///
/// Each iteration sleeps one interval and then asks for the job status. A
/// status request is never interrupted; only the waits between them react to
/// `cancel`.
pub async fn poll_analysis(
    gateway: &dyn AnalysisGateway,
    analysis_id: &str,
    policy: PollPolicy,
    cancel: &mut TriggerListener,
) -> PollOutcome {
    let deadline = Instant::now() + policy.ceiling();
    let mut attempts = 0;

    while attempts < policy.max_attempts {
        tokio::select! {
            _ = sleep(policy.interval) => {}
            _ = cancel.notified() => {
                tracing::info!(target: "controller", analysis_id, attempts, "polling cancelled");
                return PollOutcome::Cancelled;
            }
        }
        attempts += 1;

        match gateway.get_status(analysis_id).await {
            Ok(response) => match response.status {
                AnalysisStatus::Completed => match response.into_result() {
                    Some(result) => return PollOutcome::Completed(result),
                    None => {
                        tracing::debug!(
                            target: "controller",
                            analysis_id,
                            attempts,
                            "analysis completed without place information yet"
                        );
                    }
                },
                AnalysisStatus::Failed => {
                    return PollOutcome::Failed(
                        response
                            .error
                            .unwrap_or_else(|| "analysis failed".to_string()),
                    )
                }
                AnalysisStatus::Pending | AnalysisStatus::InProgress => {
                    tracing::trace!(target: "controller", analysis_id, attempts, "analysis still running");
                }
            },
            Err(err) => {
                tracing::warn!(
                    target: "controller",
                    analysis_id,
                    attempts,
                    error = %err,
                    "status check failed; polling continues"
                );
            }
        }

        if Instant::now() >= deadline {
            break;
        }
    }

    PollOutcome::TimedOut { attempts }
}
