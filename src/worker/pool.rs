use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{worker_id, WorkerContext, WorkerExit, WorkerPhase, WorkerRuntime};
use crate::controller::{ReplicaCount, ReplicaScaler, ScaleError};

struct Replica {
    id: String,
    drain: CancellationToken,
    phase: watch::Receiver<WorkerPhase>,
    handle: JoinHandle<WorkerExit>,
}

impl Replica {
    fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    fn is_busy(&self) -> bool {
        self.phase.borrow().is_busy()
    }
}

/// In-process pool of worker runtimes, each on its own tokio task.
pub struct LocalPool {
    ctx: WorkerContext,
    replicas: Mutex<Vec<Replica>>,
}

impl LocalPool {
    pub fn new(ctx: WorkerContext) -> Self {
        Self {
            ctx,
            replicas: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<Replica>>, ScaleError> {
        self.replicas
            .lock()
            .map_err(|_| ScaleError::Unavailable("replica table lock poisoned".to_string()))
    }

    fn spawn(&self) -> Replica {
        let drain = CancellationToken::new();
        let runtime = WorkerRuntime::new(worker_id("replica"), self.ctx.clone(), drain.clone());
        let id = runtime.id().to_string();
        let phase = runtime.subscribe();
        let handle = tokio::spawn(runtime.run());
        tracing::info!(worker_id = %id, "Started worker replica");
        Replica {
            id,
            drain,
            phase,
            handle,
        }
    }

    /// Drain every replica and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        let replicas = match self.lock() {
            Ok(mut replicas) => std::mem::take(&mut *replicas),
            Err(e) => {
                tracing::error!(error = %e, "Cannot shut down pool");
                return;
            }
        };

        for replica in &replicas {
            replica.drain.cancel();
        }
        for replica in replicas {
            match replica.handle.await {
                Ok(exit) => tracing::info!(worker_id = %replica.id, ?exit, "Replica exited"),
                Err(e) => {
                    tracing::error!(
                        worker_id = %replica.id,
                        error = %e,
                        "Replica task failed"
                    );
                }
            }
        }
    }
}

fn reap(replicas: &mut Vec<Replica>) {
    replicas.retain(|replica| {
        let finished = replica.handle.is_finished();
        if finished {
            tracing::debug!(worker_id = %replica.id, "Reaped finished replica");
        }
        !finished
    });
}

#[async_trait]
impl ReplicaScaler for LocalPool {
    async fn replica_count(&self) -> ReplicaCount {
        let Ok(mut replicas) = self.lock() else {
            return ReplicaCount::default();
        };
        reap(&mut replicas);

        let mut count = ReplicaCount::default();
        for replica in replicas.iter() {
            if replica.is_draining() {
                count.draining += 1;
            } else {
                count.active += 1;
                if replica.is_busy() {
                    count.busy += 1;
                }
            }
        }
        count
    }

    async fn set_replicas(&self, target: u32) -> Result<(), ScaleError> {
        let mut replicas = self.lock()?;
        reap(&mut replicas);

        let target = target as usize;
        let active = replicas.iter().filter(|r| !r.is_draining()).count();

        if active < target {
            for _ in active..target {
                let replica = self.spawn();
                replicas.push(replica);
            }
            return Ok(());
        }

        let mut excess = active - target;
        // Idle replicas first, then busy ones (which finish their job first).
        for want_busy in [false, true] {
            for replica in replicas.iter() {
                if excess == 0 {
                    break;
                }
                if !replica.is_draining() && replica.is_busy() == want_busy {
                    tracing::info!(
                        worker_id = %replica.id,
                        busy = want_busy,
                        "Draining worker replica"
                    );
                    replica.drain.cancel();
                    excess -= 1;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerSettings;
    use crate::db::memory::MemoryRegistry;
    use crate::services::processor::ProcessorTable;
    use crate::services::queue::MemoryQueue;
    use crate::services::storage::MemoryStore;
    use std::sync::Arc;

    fn pool() -> LocalPool {
        LocalPool::new(WorkerContext {
            registry: Arc::new(MemoryRegistry::new()),
            queue: Arc::new(MemoryQueue::new()),
            store: Arc::new(MemoryStore::new()),
            processors: ProcessorTable::new(),
            settings: WorkerSettings::default(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_replicas_is_idempotent() {
        let pool = pool();
        pool.set_replicas(3).await.unwrap();
        pool.set_replicas(3).await.unwrap();
        assert_eq!(pool.replica_count().await.active, 3);

        pool.set_replicas(1).await.unwrap();
        let count = pool.replica_count().await;
        assert_eq!(count.active, 1);

        pool.shutdown().await;
        assert_eq!(pool.replica_count().await, ReplicaCount::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drained_replicas_exit_and_are_reaped() {
        let pool = pool();
        pool.set_replicas(2).await.unwrap();
        pool.set_replicas(0).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let count = pool.replica_count().await;
        assert_eq!(count.active, 0);
        assert_eq!(count.draining, 0);
    }
}
