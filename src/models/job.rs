use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Unique identifier for a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle state of a job in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Whether `self -> next` is an edge of the job lifecycle.
    ///
    /// The only backwards edge is PROCESSING -> QUEUED (retry).
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Processing)
                | (JobState::Processing, JobState::Queued)
                | (JobState::Processing, JobState::Completed)
                | (JobState::Processing, JobState::Failed)
        )
    }
}

/// Kind of work a job carries; selects the processor a worker invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobKind {
    StyleTransfer,
    Chat,
    Recommendation,
}

/// Style transfer parameters. Images are referenced by blob key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleTransferPayload {
    pub content_image_key: String,
    pub style_image_key: String,
    pub influence: f64,
    pub creativity: f64,
    pub additional_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub question: String,
}

/// Filters for a tourism recommendation. Absent filters match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct Preferences {
    #[garde(length(min = 1, max = 100))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    #[garde(length(min = 1, max = 100))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,

    #[garde(range(min = 0.0))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price: Option<f64>,

    #[garde(range(min = 0.0, max = 5.0))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_rating: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationPayload {
    pub user_id: String,
    pub preferences: Preferences,
    pub limit: u32,
}

/// Job input as persisted in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    StyleTransfer(StyleTransferPayload),
    Chat(ChatPayload),
    Recommendation(RecommendationPayload),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::StyleTransfer(_) => JobKind::StyleTransfer,
            JobPayload::Chat(_) => JobKind::Chat,
            JobPayload::Recommendation(_) => JobKind::Recommendation,
        }
    }

    /// Blob keys owned by this payload.
    pub fn blob_keys(&self) -> Vec<&str> {
        match self {
            JobPayload::StyleTransfer(p) => {
                vec![p.content_image_key.as_str(), p.style_image_key.as_str()]
            }
            JobPayload::Chat(_) | JobPayload::Recommendation(_) => Vec::new(),
        }
    }
}

/// Metadata of a published result. The output bytes live in the result store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub output_key: String,
    pub content_type: String,
    pub processing_time: f64,
    pub produced_at: DateTime<Utc>,
}

/// Input for [`crate::db::registry::JobRegistry::create`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub payload: JobPayload,
}

/// A job row in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub state: JobState,
    pub attempt_count: i32,
    pub failure_reason: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_deadline: Option<DateTime<Utc>>,
    pub result: Option<ResultRecord>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A PROCESSING job whose lease deadline has passed is held by a dead worker.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Processing
            && self.lease_deadline.map(|deadline| deadline <= now).unwrap_or(true)
    }
}

/// A worker's time-bounded claim on a job, as held by the worker itself.
#[derive(Debug, Clone)]
pub struct WorkerLease {
    pub job_id: JobId,
    pub worker_id: String,
    /// Attempt number assigned by the claim; fences late completions.
    pub attempt: i32,
    pub acquired_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// What happens to a job whose attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Retry if attempts remain, otherwise fail.
    Retry { max_attempts: i32 },
    /// Fail immediately.
    Fail,
}

/// Where a released job ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Requeued,
    Failed,
}

/// Result key for the output of one attempt. Keys are per attempt so a fenced
/// late writer never touches the published output.
pub fn output_key(job_id: JobId, attempt: i32) -> String {
    format!("results/{}/attempt-{}", job_id, attempt)
}

/// Blob key for one of a job's inputs.
pub fn input_key(job_id: JobId, name: &str) -> String {
    format!("inputs/{}/{}", job_id, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_edges() {
        assert!(JobState::Queued.can_transition_to(JobState::Processing));
        assert!(JobState::Processing.can_transition_to(JobState::Queued));
        assert!(JobState::Processing.can_transition_to(JobState::Completed));
        assert!(JobState::Processing.can_transition_to(JobState::Failed));

        assert!(!JobState::Queued.can_transition_to(JobState::Completed));
        assert!(!JobState::Queued.can_transition_to(JobState::Failed));
        assert!(!JobState::Completed.can_transition_to(JobState::Queued));
        assert!(!JobState::Failed.can_transition_to(JobState::Processing));
        assert!(!JobState::Completed.can_transition_to(JobState::Failed));
    }

    #[test]
    fn test_state_string_forms() {
        assert_eq!(JobState::Processing.to_string(), "processing");
        assert_eq!("completed".parse::<JobState>().unwrap(), JobState::Completed);
        assert_eq!(JobKind::StyleTransfer.to_string(), "style_transfer");
        assert_eq!(
            serde_json::to_value(JobState::Queued).unwrap(),
            serde_json::json!("queued")
        );
    }

    #[test]
    fn test_payload_is_tagged_by_kind() {
        let payload = JobPayload::Chat(ChatPayload {
            question: "What is batik?".to_string(),
        });
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["kind"], "chat");
        assert_eq!(payload.kind(), JobKind::Chat);
        assert!(payload.blob_keys().is_empty());
    }

    #[test]
    fn test_recommendation_payload_omits_unset_filters() {
        let payload = JobPayload::Recommendation(RecommendationPayload {
            user_id: "u-7".to_string(),
            preferences: Preferences {
                city: Some("Yogyakarta".to_string()),
                ..Preferences::default()
            },
            limit: 5,
        });
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["kind"], "recommendation");
        assert_eq!(value["preferences"], serde_json::json!({ "city": "Yogyakarta" }));
        assert_eq!(JobKind::Recommendation.to_string(), "recommendation");

        let back: JobPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_preferences_bounds() {
        let ok = Preferences {
            max_price: Some(20000.0),
            min_rating: Some(4.5),
            ..Preferences::default()
        };
        assert!(ok.validate().is_ok());
        assert!(Preferences::default().validate().is_ok());

        let bad_rating = Preferences {
            min_rating: Some(7.0),
            ..Preferences::default()
        };
        assert!(bad_rating.validate().is_err());
        let negative_price = Preferences {
            max_price: Some(-1.0),
            ..Preferences::default()
        };
        assert!(negative_price.validate().is_err());
    }
}
