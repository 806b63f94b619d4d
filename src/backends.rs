use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::{self, registry::JobRegistry, registry::PgRegistry};
use crate::models::job::JobKind;
use crate::services::model_client::ModelServingClient;
use crate::services::processor::ProcessorTable;
use crate::services::queue::{JobQueue, QueueError, RedisQueue};
use crate::services::storage::{BlobStore, R2Client, StorageError};

/// Production registry, queue and result store shared by every binary.
#[derive(Clone)]
pub struct Backends {
    pub registry: Arc<dyn JobRegistry>,
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn BlobStore>,
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("queue: {0}")]
    Queue(#[from] QueueError),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

impl Backends {
    /// Connect to Postgres (running migrations when asked), Redis and R2.
    pub async fn connect(config: &AppConfig, migrate: bool) -> Result<Self, StartupError> {
        tracing::info!("Connecting to PostgreSQL database");
        let pool = db::init_pool(&config.database_url).await?;
        if migrate {
            tracing::info!("Running database migrations");
            db::run_migrations(&pool).await?;
        }

        tracing::info!("Connecting to Redis job queue");
        let queue = RedisQueue::new(&config.redis_url, &config.queue_prefix)?;

        tracing::info!("Initializing R2 storage client");
        let store = R2Client::new(
            &config.r2_bucket,
            &config.r2_endpoint,
            &config.r2_access_key,
            &config.r2_secret_key,
        )?;

        Ok(Self {
            registry: Arc::new(PgRegistry::new(pool)),
            queue: Arc::new(queue),
            store: Arc::new(store),
        })
    }
}

/// Model-serving processors for every kind with a configured endpoint.
pub fn processors(config: &AppConfig) -> ProcessorTable {
    let mut table = ProcessorTable::new().with(
        JobKind::StyleTransfer,
        Arc::new(ModelServingClient::new(&config.style_model_url)),
    );
    let optional = [
        (JobKind::Chat, &config.chat_model_url, "CHAT_MODEL_URL"),
        (
            JobKind::Recommendation,
            &config.recommendation_model_url,
            "RECOMMENDATION_MODEL_URL",
        ),
    ];
    for (kind, url, var) in optional {
        match url {
            Some(url) => table = table.with(kind, Arc::new(ModelServingClient::new(url))),
            None => tracing::warn!("{} not set, {} jobs will fail", var, kind),
        }
    }
    table
}
