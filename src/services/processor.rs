use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::job::{JobKind, Preferences};

/// Resolved input handed to a processor: blobs downloaded, parameters
/// copied from the registry payload.
#[derive(Debug, Clone)]
pub enum JobInput {
    StyleTransfer {
        content_image: Vec<u8>,
        style_image: Vec<u8>,
        influence: f64,
        creativity: f64,
        additional_prompt: Option<String>,
    },
    Chat {
        question: String,
    },
    Recommendation {
        user_id: String,
        preferences: Preferences,
        limit: u32,
    },
}

impl JobInput {
    pub fn kind(&self) -> JobKind {
        match self {
            JobInput::StyleTransfer { .. } => JobKind::StyleTransfer,
            JobInput::Chat { .. } => JobKind::Chat,
            JobInput::Recommendation { .. } => JobKind::Recommendation,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorOutput {
    pub data: Vec<u8>,
    pub content_type: String,
}

/// Failure reported by a processor.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProcessingError {
    /// Worth another attempt (resource exhaustion, unreachable model server).
    #[error("transient processing error: {0}")]
    Transient(String),

    /// Retrying cannot help (corrupt input).
    #[error("fatal processing error: {0}")]
    Fatal(String),
}

/// External processing collaborator for one job kind.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, input: &JobInput) -> Result<ProcessorOutput, ProcessingError>;
}

/// Lookup table from job kind to the processor that handles it.
#[derive(Clone, Default)]
pub struct ProcessorTable {
    processors: HashMap<JobKind, Arc<dyn Processor>>,
}

impl ProcessorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: JobKind, processor: Arc<dyn Processor>) -> Self {
        self.processors.insert(kind, processor);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn Processor>> {
        self.processors.get(&kind).cloned()
    }
}
