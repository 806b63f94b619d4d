use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::processor::{JobInput, Processor, ProcessingError, ProcessorOutput};
use crate::models::job::Preferences;
use crate::models::submission::Place;

/// Client for a model-serving endpoint (diffusion style transfer, chat or
/// recommendation).
pub struct ModelServingClient {
    http: Client,
    endpoint: String,
}

#[derive(Serialize)]
struct StyleTransferBody<'a> {
    content_image: String,
    style_image: String,
    influence: f64,
    creativity: f64,
    additional_prompt: &'a str,
}

#[derive(Deserialize)]
struct StyleTransferReply {
    result_image: String,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    question: &'a str,
}

#[derive(Deserialize)]
struct ChatReply {
    answer: String,
}

#[derive(Serialize)]
struct RecommendationBody<'a> {
    user_id: &'a str,
    preferences: &'a Preferences,
    limit: u32,
}

#[derive(Deserialize)]
struct RecommendationReply {
    recommendations: Vec<Place>,
}

impl ModelServingClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        body: &B,
    ) -> Result<R, ProcessingError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(body)
            .send()
            .await
            .map_err(|e| ProcessingError::Transient(format!("model server unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        response
            .json()
            .await
            .map_err(|e| ProcessingError::Transient(format!("malformed model response: {}", e)))
    }
}

/// 400 and 422 mean the model server rejected the input itself.
fn classify_status(status: StatusCode, body: &str) -> ProcessingError {
    let message = format!("model server returned {}: {}", status.as_u16(), body.trim());
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ProcessingError::Fatal(message)
        }
        _ => ProcessingError::Transient(message),
    }
}

/// MIME type of generated image bytes.
pub fn image_content_type(data: &[u8]) -> &'static str {
    match image::guess_format(data) {
        Ok(image::ImageFormat::Png) => "image/png",
        Ok(image::ImageFormat::Jpeg) => "image/jpeg",
        Ok(image::ImageFormat::WebP) => "image/webp",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl Processor for ModelServingClient {
    async fn process(&self, input: &JobInput) -> Result<ProcessorOutput, ProcessingError> {
        let engine = base64::engine::general_purpose::STANDARD;
        match input {
            JobInput::StyleTransfer {
                content_image,
                style_image,
                influence,
                creativity,
                additional_prompt,
            } => {
                let body = StyleTransferBody {
                    content_image: engine.encode(content_image),
                    style_image: engine.encode(style_image),
                    influence: *influence,
                    creativity: *creativity,
                    additional_prompt: additional_prompt.as_deref().unwrap_or(""),
                };
                let reply: StyleTransferReply = self.post(&body).await?;
                let data = engine.decode(reply.result_image.trim()).map_err(|e| {
                    ProcessingError::Transient(format!("result image is not base64: {}", e))
                })?;
                Ok(ProcessorOutput {
                    content_type: image_content_type(&data).to_string(),
                    data,
                })
            }
            JobInput::Chat { question } => {
                let reply: ChatReply = self.post(&ChatBody { question }).await?;
                Ok(ProcessorOutput {
                    data: reply.answer.into_bytes(),
                    content_type: "text/plain; charset=utf-8".to_string(),
                })
            }
            JobInput::Recommendation {
                user_id,
                preferences,
                limit,
            } => {
                let body = RecommendationBody {
                    user_id,
                    preferences,
                    limit: *limit,
                };
                let reply: RecommendationReply = self.post(&body).await?;
                let mut places = reply.recommendations;
                places.truncate(*limit as usize);
                let data = serde_json::to_vec(&places).map_err(|e| {
                    ProcessingError::Fatal(format!("cannot encode recommendations: {}", e))
                })?;
                Ok(ProcessorOutput {
                    data,
                    content_type: "application/json".to_string(),
                })
            }
        }
    }
}
