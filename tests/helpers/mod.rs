//! Shared in-memory stack and scripted processors for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stylequeue::app_state::AppState;
use stylequeue::config::{GatewaySettings, WorkerSettings};
use stylequeue::db::memory::MemoryRegistry;
use stylequeue::models::job::{JobId, JobKind, Preferences};
use stylequeue::models::submission::{ChatRequest, RecommendationRequest, StyleTransferRequest};
use stylequeue::services::gateway::Gateway;
use stylequeue::services::processor::{
    JobInput, Processor, ProcessingError, ProcessorOutput, ProcessorTable,
};
use stylequeue::services::queue::MemoryQueue;
use stylequeue::services::retry::RetryPolicy;
use stylequeue::services::storage::MemoryStore;
use stylequeue::worker::{WorkerContext, WorkerRuntime};

/// 1x1 PNG.
pub const PNG_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNk+M9QDwADhgGAWjR9awAAAABJRU5ErkJggg==";

pub fn png_bytes() -> Vec<u8> {
    base64::engine::general_purpose::STANDARD
        .decode(PNG_B64)
        .unwrap()
}

/// What a scripted processor does on one call.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    SucceedAfter(Duration),
    Transient(&'static str),
    Fatal(&'static str),
    /// Never returns; only a timeout or abort ends the call.
    Hang,
}

/// Processor that plays back a fixed script, then succeeds forever.
pub struct ScriptedProcessor {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicU32,
}

impl ScriptedProcessor {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

fn output_for(input: &JobInput) -> ProcessorOutput {
    match input {
        JobInput::StyleTransfer { .. } => ProcessorOutput {
            data: png_bytes(),
            content_type: "image/png".to_string(),
        },
        JobInput::Chat { question } => ProcessorOutput {
            data: format!("You asked: {}", question).into_bytes(),
            content_type: "text/plain; charset=utf-8".to_string(),
        },
        JobInput::Recommendation {
            preferences, limit, ..
        } => {
            let city = preferences.city.clone().unwrap_or_else(|| "Jakarta".to_string());
            let places: Vec<serde_json::Value> = (1..=*limit)
                .map(|n| {
                    serde_json::json!({
                        "place_id": n,
                        "place_name": format!("Place {}", n),
                        "description": "",
                        "category": "Budaya",
                        "city": city,
                        "price": 0.0,
                        "rating": 5.0 - f64::from(n) * 0.1,
                        "time_minutes": null,
                        "latitude": -6.2,
                        "longitude": 106.8
                    })
                })
                .collect();
            ProcessorOutput {
                data: serde_json::to_vec(&places).unwrap(),
                content_type: "application/json".to_string(),
            }
        }
    }
}

#[async_trait]
impl Processor for ScriptedProcessor {
    async fn process(&self, input: &JobInput) -> Result<ProcessorOutput, ProcessingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Succeed);

        match step {
            Step::Succeed => Ok(output_for(input)),
            Step::SucceedAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(output_for(input))
            }
            Step::Transient(msg) => Err(ProcessingError::Transient(msg.to_string())),
            Step::Fatal(msg) => Err(ProcessingError::Fatal(msg.to_string())),
            Step::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// Registry, queue and store in memory, plus a gateway over them.
pub struct TestStack {
    pub registry: Arc<MemoryRegistry>,
    pub queue: Arc<MemoryQueue>,
    pub store: Arc<MemoryStore>,
    pub gateway: Gateway,
}

impl TestStack {
    pub fn new() -> Self {
        let registry = Arc::new(MemoryRegistry::new());
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        let gateway = Gateway::new(
            registry.clone(),
            queue.clone(),
            store.clone(),
            GatewaySettings {
                enqueue_retry: RetryPolicy::none(),
            },
        );
        Self {
            registry,
            queue,
            store,
            gateway,
        }
    }

    pub fn context(
        &self,
        processor: Arc<ScriptedProcessor>,
        settings: WorkerSettings,
    ) -> WorkerContext {
        WorkerContext {
            registry: self.registry.clone(),
            queue: self.queue.clone(),
            store: self.store.clone(),
            processors: ProcessorTable::new()
                .with(JobKind::StyleTransfer, processor.clone())
                .with(JobKind::Chat, processor.clone())
                .with(JobKind::Recommendation, processor),
            settings,
        }
    }

    pub fn worker(
        &self,
        id: &str,
        processor: Arc<ScriptedProcessor>,
        settings: WorkerSettings,
    ) -> WorkerRuntime {
        WorkerRuntime::new(
            id,
            self.context(processor, settings),
            tokio_util::sync::CancellationToken::new(),
        )
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(self.gateway.clone())
    }

    pub async fn submit_style(&self, influence: f64, creativity: f64) -> JobId {
        self.gateway
            .submit_style_transfer(style_request(influence, creativity))
            .await
            .unwrap()
    }

    pub async fn submit_chat(&self, question: &str) -> JobId {
        self.gateway
            .submit_chat(ChatRequest {
                question: question.to_string(),
            })
            .await
            .unwrap()
    }

    pub async fn submit_recommendation(&self, city: &str, limit: u32) -> JobId {
        self.gateway
            .submit_recommendation(RecommendationRequest {
                user_id: "user-1".to_string(),
                preferences: Preferences {
                    city: Some(city.to_string()),
                    ..Preferences::default()
                },
                limit,
            })
            .await
            .unwrap()
    }

    /// Result blobs currently in the store.
    pub fn result_keys(&self) -> Vec<String> {
        self.store
            .keys()
            .into_iter()
            .filter(|k| k.starts_with("results/"))
            .collect()
    }
}

pub fn style_request(influence: f64, creativity: f64) -> StyleTransferRequest {
    StyleTransferRequest {
        content_image: PNG_B64.to_string(),
        style_image: PNG_B64.to_string(),
        influence,
        creativity,
        additional_prompt: Some("oil painting".to_string()),
    }
}

/// Worker settings with short timeouts for paused-clock tests.
pub fn fast_settings() -> WorkerSettings {
    WorkerSettings {
        max_attempts: 3,
        job_timeout: Duration::from_secs(30),
        visibility_timeout: Duration::from_secs(60),
        poll_interval: Duration::from_millis(100),
        abandon_delay: Duration::from_secs(5),
        idle_exit: None,
        infra_retry: RetryPolicy::default(),
    }
}

/// Serve the gateway router on an ephemeral port; returns its base URL.
pub async fn spawn_server(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = stylequeue::router(state, 20 * 1024 * 1024);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}
