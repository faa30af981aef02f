use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::fetch::ExtractedData;

pub type JobId = i64;

/// Lifecycle of a fetch job.
///
/// PENDING -> RUNNING on dispatch; RUNNING -> COMPLETED | FAILED on outcome;
/// RUNNING -> PENDING when a retry is scheduled or a stale job is reclaimed;
/// PENDING | RUNNING -> CANCELLED on external cancellation.
/// COMPLETED, FAILED and CANCELLED have no outgoing edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Statuses a job may be in right before moving to `target`
    pub fn sources(target: JobStatus) -> &'static [JobStatus] {
        match target {
            Self::Pending => &[Self::Running],
            Self::Running => &[Self::Pending],
            Self::Completed | Self::Failed => &[Self::Running],
            Self::Cancelled => &[Self::Pending, Self::Running],
        }
    }

    pub fn can_transition(self, target: JobStatus) -> bool {
        Self::sources(target).contains(&self)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => anyhow::bail!("Unknown job status: {}", other),
        }
    }
}

/// Dispatch priority, higher goes first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    #[default]
    Medium = 2,
    High = 3,
}

impl Priority {
    pub fn rank(&self) -> i16 {
        *self as i16
    }

    pub fn from_rank(rank: i16) -> Self {
        match rank {
            i16::MIN..=1 => Self::Low,
            2 => Self::Medium,
            _ => Self::High,
        }
    }
}

/// Per-job configuration blob
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Field name -> CSS selector
    #[serde(default)]
    pub selectors: BTreeMap<String, String>,

    /// Overrides the executor's default fetch timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Anything else the submitting layer stored alongside
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A scheduled unit of fetch work as held by the task store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub url: String,

    /// Cron expression, owned by the layer that creates jobs
    pub schedule: Option<String>,

    pub status: JobStatus,
    pub priority: Priority,
    pub config: JobConfig,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub retry_count: u32,

    pub result: Option<Value>,
    pub error_message: Option<String>,
}

impl Job {
    /// Build a fresh PENDING job from a submission payload
    pub fn from_submission(id: JobId, submission: JobSubmission, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: submission.name,
            url: submission.url,
            schedule: submission.schedule,
            status: JobStatus::Pending,
            priority: submission.priority,
            config: submission.config,
            headers: submission.headers.unwrap_or_default(),
            cookies: submission.cookies.unwrap_or_default(),
            created_at: now,
            updated_at: now,
            last_run: None,
            next_run: None,
            retry_count: 0,
            result: None,
            error_message: None,
        }
    }

    /// PENDING and due
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_run.map_or(true, |due| due <= now)
    }

    /// Dispatch order: priority descending, then oldest due first
    pub fn dispatch_order(a: &Job, b: &Job) -> std::cmp::Ordering {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.next_run.cmp(&b.next_run))
            .then_with(|| a.id.cmp(&b.id))
    }

    /// Host part of the target URL, used as the cookie cache key
    pub fn domain(&self) -> Option<String> {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
    }

    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) {
        self.status = update.status;
        self.updated_at = now;

        if let Some(message) = &update.error_message {
            self.error_message = Some(message.clone());
        }
        if let Some(count) = update.retry_count {
            self.retry_count = count;
        }
        if let Some(next_run) = update.next_run {
            self.next_run = next_run;
        }
        if let Some(last_run) = update.last_run {
            self.last_run = Some(last_run);
        }
        if let Some(result) = &update.result {
            self.result = Some(result.clone());
        }
    }
}

/// The fields a status write may touch besides the status itself.
/// `None` leaves a field alone; `next_run: Some(None)` clears it.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub retry_count: Option<u32>,
    pub next_run: Option<Option<DateTime<Utc>>>,
    pub last_run: Option<DateTime<Utc>>,
    pub result: Option<Value>,
}

impl StatusUpdate {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            error_message: None,
            retry_count: None,
            next_run: None,
            last_run: None,
            result: None,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn with_next_run(mut self, next_run: Option<DateTime<Utc>>) -> Self {
        self.next_run = Some(next_run);
        self
    }

    pub fn with_last_run(mut self, last_run: DateTime<Utc>) -> Self {
        self.last_run = Some(last_run);
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }
}

/// What the request-handling layer hands over when a job is created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub config: JobConfig,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub cookies: Option<HashMap<String, String>>,
}

/// What the core reports back for one execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    pub task_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ExtractedData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(id: JobId, priority: Priority, next_run: Option<DateTime<Utc>>) -> Job {
        let submission = JobSubmission {
            name: format!("job-{}", id),
            url: "https://Example.com/items?page=1".to_string(),
            schedule: None,
            priority,
            config: JobConfig::default(),
            headers: None,
            cookies: None,
        };
        let mut job = Job::from_submission(id, submission, Utc::now());
        job.next_run = next_run;
        job
    }

    #[test]
    fn test_state_machine_edges() {
        use JobStatus::*;

        assert!(Pending.can_transition(Running));
        assert!(Running.can_transition(Completed));
        assert!(Running.can_transition(Failed));
        assert!(Running.can_transition(Pending));
        assert!(Pending.can_transition(Cancelled));
        assert!(Running.can_transition(Cancelled));

        assert!(!Running.can_transition(Running));
        assert!(!Pending.can_transition(Completed));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for target in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition(target), "{} -> {}", terminal, target);
            }
        }
    }

    #[test]
    fn test_eligibility() {
        let now = Utc::now();
        assert!(job(1, Priority::Low, None).is_eligible(now));
        assert!(job(2, Priority::Low, Some(now - Duration::seconds(5))).is_eligible(now));
        assert!(!job(3, Priority::Low, Some(now + Duration::seconds(5))).is_eligible(now));

        let mut running = job(4, Priority::Low, None);
        running.status = JobStatus::Running;
        assert!(!running.is_eligible(now));
    }

    #[test]
    fn test_dispatch_order() {
        let now = Utc::now();
        let mut jobs = vec![
            job(1, Priority::Low, Some(now - Duration::seconds(100))),
            job(2, Priority::High, Some(now - Duration::seconds(1))),
            job(3, Priority::High, Some(now - Duration::seconds(50))),
            job(4, Priority::Medium, None),
        ];

        jobs.sort_by(Job::dispatch_order);
        let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![3, 2, 4, 1]);
    }

    #[test]
    fn test_domain_is_lowercased_host() {
        assert_eq!(job(1, Priority::Low, None).domain().as_deref(), Some("example.com"));
    }

    #[test]
    fn test_submission_payload_parsing() {
        let payload = r#"{
            "name": "prices",
            "url": "https://shop.example.com/p/1",
            "priority": "high",
            "config": {"selectors": {"price": ".price"}, "timeout_secs": 5, "note": "x"},
            "headers": {"Referer": "https://shop.example.com"}
        }"#;

        let submission: JobSubmission = serde_json::from_str(payload).unwrap();
        assert_eq!(submission.priority, Priority::High);
        assert_eq!(submission.config.selectors["price"], ".price");
        assert_eq!(submission.config.timeout_secs, Some(5));
        assert_eq!(submission.config.extra["note"], "x");
        assert!(submission.cookies.is_none());
    }

    #[test]
    fn test_apply_clears_next_run() {
        let now = Utc::now();
        let mut job = job(1, Priority::Low, Some(now));
        let update = StatusUpdate::new(JobStatus::Failed)
            .with_error("HTTP 500")
            .with_next_run(None);

        job.apply(&update, now);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.next_run, None);
        assert_eq!(job.error_message.as_deref(), Some("HTTP 500"));
    }
}
