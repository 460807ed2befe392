//! Job definitions and submission-time validation.
//!
//! A job definition is a template: an HTTP request plus the rule deciding when
//! it fires (cron schedule, immediately, or after a delay).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::schedule::{Schedule, ScheduleError};
use super::types::{JobName, QueueName};

/// Timezone used for recurring jobs that do not name one.
pub const DEFAULT_TIMEZONE: &str = "UTC";

/// Longest accepted delay for delayed jobs (ten years).
pub const MAX_DELAY_SECONDS: u64 = 10 * 366 * 24 * 60 * 60;

/// Reasons a job definition is rejected at submission.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The job name is empty.
    #[error("job name must not be empty")]
    EmptyName,

    /// A field required by the job type is missing.
    #[error("job '{job}': {field} is required for {job_type} jobs")]
    MissingField {
        job: String,
        job_type: JobType,
        field: &'static str,
    },

    /// A field is present that the job type does not accept.
    #[error("job '{job}': {field} is not allowed for {job_type} jobs")]
    UnexpectedField {
        job: String,
        job_type: JobType,
        field: &'static str,
    },

    /// The delay is longer than the engine accepts.
    #[error("job '{job}': delay of {delay_seconds}s exceeds the maximum of {max}s")]
    DelayTooLong {
        job: String,
        delay_seconds: u64,
        max: u64,
    },

    /// The cron expression or timezone is invalid.
    #[error("job '{job}': {source}")]
    InvalidSchedule {
        job: String,
        #[source]
        source: ScheduleError,
    },

    /// The HTTP method is not a valid token.
    #[error("invalid HTTP method: {0}")]
    InvalidMethod(String),

    /// The target URL is not an absolute http(s) URL.
    #[error("invalid target URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// A header name or value cannot be sent.
    #[error("invalid header '{0}'")]
    InvalidHeader(String),

    /// The queue is not configured.
    #[error("unknown queue '{0}'")]
    UnknownQueue(String),

    /// A recurring job was resubmitted as a different type, or vice versa.
    #[error("job '{job}' already exists as a {existing} job")]
    TypeChanged { job: String, existing: JobType },
}

/// How a job is fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Fired repeatedly per a cron schedule.
    Recurring,
    /// Executed once, as soon as a worker is available.
    FireAndForget,
    /// Executed once, no earlier than an offset from submission.
    Delayed,
}

impl JobType {
    /// Stable string form, used by storage and the CLI.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Recurring => "recurring",
            JobType::FireAndForget => "fire_and_forget",
            JobType::Delayed => "delayed",
        }
    }

    /// Whether the definition is consumed after its single execution.
    pub fn is_one_shot(&self) -> bool {
        !matches!(self, JobType::Recurring)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recurring" => Ok(JobType::Recurring),
            "fire_and_forget" => Ok(JobType::FireAndForget),
            "delayed" => Ok(JobType::Delayed),
            other => Err(format!("unknown job type: {}", other)),
        }
    }
}

/// The HTTP call a job makes.
///
/// The body is opaque and forwarded byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    /// HTTP method, e.g. `POST`.
    #[serde(default = "default_method")]
    pub method: String,
    /// Absolute http(s) target URL.
    pub url: String,
    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request body.
    #[serde(default, with = "body_text")]
    pub body: Vec<u8>,
}

fn default_method() -> String {
    "POST".to_string()
}

impl HttpRequest {
    /// Create a request with no headers and an empty body.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Check that the request can be sent as-is.
    pub fn validate(&self) -> Result<(), ValidationError> {
        reqwest::Method::from_bytes(self.method.as_bytes())
            .map_err(|_| ValidationError::InvalidMethod(self.method.clone()))?;

        let url = reqwest::Url::parse(&self.url).map_err(|e| ValidationError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ValidationError::InvalidUrl {
                url: self.url.clone(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        for (name, value) in &self.headers {
            reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ValidationError::InvalidHeader(name.clone()))?;
            reqwest::header::HeaderValue::from_str(value)
                .map_err(|_| ValidationError::InvalidHeader(name.clone()))?;
        }
        Ok(())
    }
}

/// A job definition as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Unique job name.
    pub name: JobName,
    /// How the job fires.
    pub job_type: JobType,
    /// Five-field cron expression (recurring only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    /// IANA timezone the schedule is evaluated in (recurring only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Offset from submission (delayed only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u64>,
    /// The HTTP call to make.
    #[serde(flatten)]
    pub request: HttpRequest,
    /// Dispatch queue.
    #[serde(default)]
    pub queue: QueueName,
    /// Retries after the initial attempt.
    #[serde(default)]
    pub max_retries: u32,
}

impl JobDefinition {
    fn new(name: impl Into<JobName>, job_type: JobType, request: HttpRequest) -> Self {
        Self {
            name: name.into(),
            job_type,
            cron_expression: None,
            timezone: None,
            delay_seconds: None,
            request,
            queue: QueueName::default(),
            max_retries: 0,
        }
    }

    /// A job fired on a cron schedule.
    pub fn recurring(
        name: impl Into<JobName>,
        cron_expression: impl Into<String>,
        request: HttpRequest,
    ) -> Self {
        let mut job = Self::new(name, JobType::Recurring, request);
        job.cron_expression = Some(cron_expression.into());
        job
    }

    /// A job executed once, immediately.
    pub fn fire_and_forget(name: impl Into<JobName>, request: HttpRequest) -> Self {
        Self::new(name, JobType::FireAndForget, request)
    }

    /// A job executed once after `delay_seconds`.
    pub fn delayed(name: impl Into<JobName>, delay_seconds: u64, request: HttpRequest) -> Self {
        let mut job = Self::new(name, JobType::Delayed, request);
        job.delay_seconds = Some(delay_seconds);
        job
    }

    /// Set the dispatch queue.
    pub fn with_queue(mut self, queue: impl Into<QueueName>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the schedule timezone.
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    /// Timezone of the schedule, defaulting to UTC.
    pub fn timezone_or_default(&self) -> &str {
        self.timezone.as_deref().unwrap_or(DEFAULT_TIMEZONE)
    }

    /// Parse the schedule of a recurring job.
    pub fn schedule(&self) -> Result<Option<Schedule>, ValidationError> {
        match &self.cron_expression {
            Some(expr) => Schedule::with_timezone(expr.as_str(), self.timezone_or_default())
                .map(Some)
                .map_err(|source| ValidationError::InvalidSchedule {
                    job: self.name.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Validate required fields per job type, the schedule, the request and
    /// the queue.
    pub fn validate(&self, known_queues: &[QueueName]) -> Result<(), ValidationError> {
        if self.name.as_str().trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }

        let recurring = self.job_type == JobType::Recurring;
        let delayed = self.job_type == JobType::Delayed;
        self.check_field("cron_expression", self.cron_expression.is_some(), recurring)?;
        self.check_field("delay_seconds", self.delay_seconds.is_some(), delayed)?;
        if let Some(delay_seconds) = self.delay_seconds {
            if delay_seconds > MAX_DELAY_SECONDS {
                return Err(ValidationError::DelayTooLong {
                    job: self.name.to_string(),
                    delay_seconds,
                    max: MAX_DELAY_SECONDS,
                });
            }
        }
        if self.timezone.is_some() && !recurring {
            return Err(ValidationError::UnexpectedField {
                job: self.name.to_string(),
                job_type: self.job_type,
                field: "timezone",
            });
        }

        self.schedule()?;
        self.request.validate()?;

        if !known_queues.contains(&self.queue) {
            return Err(ValidationError::UnknownQueue(self.queue.to_string()));
        }
        Ok(())
    }

    fn check_field(
        &self,
        field: &'static str,
        present: bool,
        expected: bool,
    ) -> Result<(), ValidationError> {
        match (present, expected) {
            (false, true) => Err(ValidationError::MissingField {
                job: self.name.to_string(),
                job_type: self.job_type,
                field,
            }),
            (true, false) => Err(ValidationError::UnexpectedField {
                job: self.name.to_string(),
                job_type: self.job_type,
                field,
            }),
            _ => Ok(()),
        }
    }
}

/// Serde helper that carries a body as text.
///
/// Bodies that are not valid UTF-8 are serialized lossily; they only reach
/// this path through inspection output.
mod body_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&String::from_utf8_lossy(body))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        Ok(text.into_bytes())
    }
}
