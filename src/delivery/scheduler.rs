//! Tokio-timer backend for deferred sends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::delivery::machine::TaskScheduler;
use crate::delivery::newsletter::TaskHandle;
use crate::error::StateError;

/// In-process scheduler: one sleeping task per pending send, firing the
/// newsletter id into a channel the delivery loop consumes.
pub struct TokioTaskScheduler {
    fire_tx: mpsc::UnboundedSender<Uuid>,
    tasks: Arc<RwLock<HashMap<String, JoinHandle<()>>>>,
}

impl TokioTaskScheduler {
    /// Returns the scheduler and the receiver the delivery loop drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        (
            Self {
                fire_tx,
                tasks: Arc::new(RwLock::new(HashMap::new())),
            },
            fire_rx,
        )
    }

    pub async fn pending(&self) -> usize {
        self.tasks.read().await.len()
    }
}

#[async_trait]
impl TaskScheduler for TokioTaskScheduler {
    async fn schedule(
        &self,
        run_at: DateTime<Utc>,
        newsletter_id: Uuid,
    ) -> Result<TaskHandle, StateError> {
        let key = Uuid::new_v4().to_string();
        let delay = (run_at - Utc::now())
            .to_std()
            .map_err(|_| StateError::ReleaseInPast {
                id: newsletter_id.to_string(),
            })?;

        let fire_tx = self.fire_tx.clone();
        let tasks = Arc::clone(&self.tasks);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tasks.write().await.remove(&task_key);
            // Receiver gone means the delivery loop is shutting down.
            let _ = fire_tx.send(newsletter_id);
        });

        self.tasks.write().await.insert(key.clone(), handle);
        info!(%newsletter_id, %run_at, "send task registered");
        Ok(TaskHandle(key))
    }

    async fn revoke(&self, handle: &TaskHandle) -> Result<(), StateError> {
        match self.tasks.write().await.remove(&handle.0) {
            Some(task) => {
                task.abort();
                info!(handle = %handle.0, "send task revoked");
                Ok(())
            }
            None => Err(StateError::MissingTaskHandle {
                id: handle.0.clone(),
            }),
        }
    }
}
