use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

use crate::cli::config::RetrySettings;
use crate::dispatch::job::{Job, JobStatus, StatusUpdate};
use crate::error::DispatchError;
use crate::fetch::FetchOutcome;

/// Where a job goes after one execution
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Complete {
        last_run: DateTime<Utc>,
    },
    Reschedule {
        retry_count: u32,
        delay: Duration,
        next_run: DateTime<Utc>,
        error: String,
    },
    Fail {
        error: DispatchError,
    },
}

impl Decision {
    /// The status write carrying this decision; `result` is stored on completion
    pub fn into_update(self, result: Option<Value>) -> StatusUpdate {
        match self {
            Self::Complete { last_run } => {
                let update = StatusUpdate::new(JobStatus::Completed).with_last_run(last_run);
                match result {
                    Some(result) => update.with_result(result),
                    None => update,
                }
            }
            Self::Reschedule { retry_count, next_run, error, .. } => StatusUpdate::new(JobStatus::Pending)
                .with_retry_count(retry_count)
                .with_next_run(Some(next_run))
                .with_error(error),
            Self::Fail { error } => StatusUpdate::new(JobStatus::Failed)
                .with_error(error.to_string())
                .with_next_run(None),
        }
    }
}

/// Exponential backoff with a retry budget. Pure: no I/O, clock passed in.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_retries,
            Duration::from_secs(settings.base_delay_secs),
            Duration::from_secs(settings.max_delay_secs),
        )
    }

    /// `base * 2^retry_count`, capped at `max_delay`
    pub fn backoff(&self, retry_count: u32) -> Duration {
        2u32.checked_pow(retry_count)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    pub fn decide(&self, job: &Job, outcome: &FetchOutcome, now: DateTime<Utc>) -> Decision {
        if outcome.success {
            return Decision::Complete { last_run: now };
        }

        let error = outcome
            .error
            .clone()
            .unwrap_or_else(|| DispatchError::Transport("Unknown error".to_string()));

        if !error.is_retryable() {
            return Decision::Fail { error };
        }

        let retry_count = job.retry_count.saturating_add(1);
        if retry_count > self.max_retries {
            return Decision::Fail {
                error: DispatchError::RetriesExhausted {
                    retries: job.retry_count,
                    last_error: error.to_string(),
                },
            };
        }

        let delay = self.backoff(retry_count);
        let next_run = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(3600));

        Decision::Reschedule {
            retry_count,
            delay,
            next_run,
            error: error.to_string(),
        }
    }
}
