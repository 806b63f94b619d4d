use garde::Validate;
use serde::{Deserialize, Serialize};

use super::job::{JobId, JobKind, JobState, Preferences};

/// Body of `POST /jobs`. Images are base64, optionally as a data URL.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct StyleTransferRequest {
    #[garde(length(min = 1))]
    pub content_image: String,

    #[garde(length(min = 1))]
    pub style_image: String,

    #[garde(range(min = 0.0, max = 1.0))]
    pub influence: f64,

    #[garde(range(min = 0.0, max = 1.0))]
    pub creativity: f64,

    #[garde(length(max = 1000))]
    pub additional_prompt: Option<String>,
}

/// Body of `POST /chat/jobs`.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ChatRequest {
    #[garde(length(min = 1, max = 2000))]
    pub question: String,
}

fn default_limit() -> u32 {
    10
}

/// Body of `POST /recommendations/jobs`.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RecommendationRequest {
    #[garde(length(min = 1, max = 100))]
    pub user_id: String,

    #[serde(default)]
    #[garde(dive)]
    pub preferences: Preferences,

    #[serde(default = "default_limit")]
    #[garde(range(min = 1, max = 50))]
    pub limit: u32,
}

/// One recommended tourist destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub place_id: i64,
    pub place_name: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    pub city: String,
    pub price: f64,
    pub rating: f64,
    #[serde(default)]
    pub time_minutes: Option<f64>,
    pub latitude: f64,
    pub longitude: f64,
}

/// Response after a job was accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: JobState,
}

/// Output of a completed job as returned to pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobOutput {
    Image {
        result_image: String,
        processing_time: f64,
    },
    Text {
        answer: String,
        processing_time: f64,
    },
    Recommendations {
        recommendations: Vec<Place>,
        total_found: usize,
        processing_time: f64,
    },
}

/// Response for `GET /jobs/{job_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub kind: JobKind,
    pub status: JobState,
    pub attempt_count: i32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<JobOutput>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}
