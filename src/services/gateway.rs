use base64::Engine;
use garde::Validate;
use std::sync::Arc;

use crate::config::GatewaySettings;
use crate::db::registry::{JobRegistry, RegistryError};
use crate::models::job::{
    input_key, ChatPayload, JobId, JobKind, JobPayload, JobState, NewJob, RecommendationPayload,
    StyleTransferPayload,
};
use crate::models::submission::{
    ChatRequest, JobOutput, JobStatusResponse, Place, RecommendationRequest, StyleTransferRequest,
};
use crate::services::model_client::image_content_type;
use crate::services::queue::{JobQueue, QueueError, QueuedJob};
use crate::services::retry::with_backoff;
use crate::services::storage::{BlobStore, StorageError};

/// Submission and status logic behind the HTTP routes. Stateless: all state
/// lives in the registry, queue and result store.
#[derive(Clone)]
pub struct Gateway {
    registry: Arc<dyn JobRegistry>,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn BlobStore>,
    settings: GatewaySettings,
}

/// A decoded input blob waiting to be written.
struct InputBlob {
    key: String,
    data: Vec<u8>,
    content_type: &'static str,
}

impl Gateway {
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn BlobStore>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            registry,
            queue,
            store,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<dyn JobRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub async fn submit_style_transfer(
        &self,
        request: StyleTransferRequest,
    ) -> Result<JobId, GatewayError> {
        request
            .validate()
            .map_err(|report| GatewayError::Validation(report.to_string()))?;

        let (content, content_type) = decode_image("content_image", &request.content_image)?;
        let (style, style_type) = decode_image("style_image", &request.style_image)?;

        let job_id = JobId::new();
        let content_key = input_key(job_id, "content");
        let style_key = input_key(job_id, "style");
        let payload = JobPayload::StyleTransfer(StyleTransferPayload {
            content_image_key: content_key.clone(),
            style_image_key: style_key.clone(),
            influence: request.influence,
            creativity: request.creativity,
            additional_prompt: request
                .additional_prompt
                .filter(|prompt| !prompt.trim().is_empty()),
        });

        let blobs = vec![
            InputBlob {
                key: content_key,
                data: content,
                content_type,
            },
            InputBlob {
                key: style_key,
                data: style,
                content_type: style_type,
            },
        ];

        self.submit(job_id, payload, blobs).await
    }

    pub async fn submit_chat(&self, request: ChatRequest) -> Result<JobId, GatewayError> {
        request
            .validate()
            .map_err(|report| GatewayError::Validation(report.to_string()))?;

        let question = request.question.trim().to_string();
        if question.is_empty() {
            return Err(GatewayError::Validation("question: must not be blank".to_string()));
        }

        let payload = JobPayload::Chat(ChatPayload { question });
        self.submit(JobId::new(), payload, Vec::new()).await
    }

    pub async fn submit_recommendation(
        &self,
        request: RecommendationRequest,
    ) -> Result<JobId, GatewayError> {
        request
            .validate()
            .map_err(|report| GatewayError::Validation(report.to_string()))?;

        let user_id = request.user_id.trim().to_string();
        if user_id.is_empty() {
            return Err(GatewayError::Validation("user_id: must not be blank".to_string()));
        }

        let payload = JobPayload::Recommendation(RecommendationPayload {
            user_id,
            preferences: request.preferences,
            limit: request.limit,
        });
        self.submit(JobId::new(), payload, Vec::new()).await
    }

    async fn submit(
        &self,
        job_id: JobId,
        payload: JobPayload,
        blobs: Vec<InputBlob>,
    ) -> Result<JobId, GatewayError> {
        let kind = payload.kind();

        for blob in &blobs {
            if let Err(e) = self.store.put(&blob.key, &blob.data, blob.content_type).await {
                self.delete_blobs(&blobs).await;
                return Err(e.into());
            }
        }

        if let Err(e) = self.registry.create(&NewJob { id: job_id, payload }).await {
            self.delete_blobs(&blobs).await;
            return Err(e.into());
        }

        let message = QueuedJob::new(job_id, kind);
        let enqueued = with_backoff(&self.settings.enqueue_retry, "enqueue", || {
            self.queue.enqueue(&message)
        })
        .await;

        if let Err(e) = enqueued {
            tracing::error!(job_id = %job_id, error = %e, "Enqueue failed, discarding job");
            if let Err(discard_err) = self.registry.discard(job_id).await {
                tracing::error!(job_id = %job_id, error = %discard_err, "Failed to discard job");
            }
            self.delete_blobs(&blobs).await;
            return Err(e.into());
        }

        metrics::counter!("jobs_submitted_total", "kind" => kind.to_string()).increment(1);
        tracing::info!(job_id = %job_id, kind = %kind, "Job submitted");

        Ok(job_id)
    }

    async fn delete_blobs(&self, blobs: &[InputBlob]) {
        for blob in blobs {
            if let Err(e) = self.store.delete(&blob.key).await {
                tracing::warn!(key = %blob.key, error = %e, "Failed to delete input blob");
            }
        }
    }

    /// Current state of a job. The result is read only once the registry says
    /// COMPLETED, which the worker publishes after the result is written.
    pub async fn get_status(&self, job_id: JobId) -> Result<JobStatusResponse, GatewayError> {
        let job = match self.registry.read(job_id).await {
            Ok(job) => job,
            Err(RegistryError::NotFound(id)) => return Err(GatewayError::NotFound(id)),
            Err(e) => return Err(e.into()),
        };

        let result = match (job.state, &job.result) {
            (JobState::Completed, Some(record)) => {
                let data = self.store.get(&record.output_key).await?;
                Some(render_output(job.kind, data, record.processing_time)?)
            }
            (JobState::Completed, None) => {
                return Err(GatewayError::Registry(RegistryError::Corrupt(format!(
                    "completed job {} has no result",
                    job_id
                ))))
            }
            _ => None,
        };

        let error = if job.state == JobState::Failed {
            Some(
                job.failure_reason
                    .clone()
                    .unwrap_or_else(|| "processing failed".to_string()),
            )
        } else {
            None
        };

        Ok(JobStatusResponse {
            job_id: job.id,
            kind: job.kind,
            status: job.state,
            attempt_count: job.attempt_count,
            result,
            error,
        })
    }
}

fn render_output(
    kind: JobKind,
    data: Vec<u8>,
    processing_time: f64,
) -> Result<JobOutput, GatewayError> {
    let output = match kind {
        JobKind::StyleTransfer => JobOutput::Image {
            result_image: base64::engine::general_purpose::STANDARD.encode(data),
            processing_time,
        },
        JobKind::Chat => JobOutput::Text {
            answer: String::from_utf8_lossy(&data).into_owned(),
            processing_time,
        },
        JobKind::Recommendation => {
            let recommendations: Vec<Place> = serde_json::from_slice(&data)
                .map_err(|e| GatewayError::CorruptResult(e.to_string()))?;
            JobOutput::Recommendations {
                total_found: recommendations.len(),
                recommendations,
                processing_time,
            }
        }
    };
    Ok(output)
}

/// Decode a base64 image, accepting a `data:image/...;base64,` prefix.
fn decode_image(field: &str, encoded: &str) -> Result<(Vec<u8>, &'static str), GatewayError> {
    let raw = match encoded.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| GatewayError::Validation(format!("{}: malformed data URL", field)))?,
        None => encoded,
    };

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .map_err(|_| GatewayError::Validation(format!("{}: invalid base64", field)))?;

    image::guess_format(&bytes)
        .map_err(|_| GatewayError::Validation(format!("{}: unsupported image format", field)))?;

    let content_type = image_content_type(&bytes);
    Ok((bytes, content_type))
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("stored result is unreadable: {0}")]
    CorruptResult(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
