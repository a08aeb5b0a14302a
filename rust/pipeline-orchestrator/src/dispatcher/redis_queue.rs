//! Redis list-backed task queue.
//!
//! Runs are pushed as JSON onto `<prefix>:queue` for external workers to
//! `BRPOP`. Workers push [`StatusEvent`] JSON onto `<prefix>:events`, which
//! [`RedisQueueDispatcher::spawn_event_pump`] forwards to the orchestrator.
//! Cancellation writes `<prefix>:revoked:<task_id>`; workers are expected to
//! check it before and while running, so cancellation is never confirmed
//! here.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{DispatchError, StatusEvent, StatusSender, TaskDispatcher, TaskHandle, TaskRequest};

/// Revocation markers outlive any reasonable worker pickup delay.
const REVOKE_TTL_SECS: u64 = 24 * 60 * 60;

/// Wait between polls of an empty events list.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Message pushed onto the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub task_id: String,
    #[serde(flatten)]
    pub request: TaskRequest,
    pub enqueued_at: DateTime<Utc>,
}

/// Key layout under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn queue(&self) -> String {
        format!("{}:queue", self.prefix)
    }

    pub fn events(&self) -> String {
        format!("{}:events", self.prefix)
    }

    pub fn revoked(&self, task_id: &str) -> String {
        format!("{}:revoked:{task_id}", self.prefix)
    }
}

/// [`TaskDispatcher`] backed by Redis lists.
#[derive(Clone)]
pub struct RedisQueueDispatcher {
    client: redis::Client,
    conn: ConnectionManager,
    keys: QueueKeys,
}

impl RedisQueueDispatcher {
    /// Connect to `url` and use keys under `prefix`.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, DispatchError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let keys = QueueKeys::new(prefix);
        tracing::info!(queue = %keys.queue(), "Connected to Redis task queue");
        Ok(Self { client, conn, keys })
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    /// Forward worker status events to `events` until `shutdown` fires.
    ///
    /// Uses its own connection so polling never queues behind submissions.
    pub fn spawn_event_pump(&self, events: StatusSender, shutdown: CancellationToken) -> JoinHandle<()> {
        let client = self.client.clone();
        let key = self.keys.events();

        tokio::spawn(async move {
            let mut conn = match ConnectionManager::new(client).await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to open Redis event connection");
                    return;
                }
            };

            loop {
                let popped = tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    popped = conn.rpop::<_, Option<String>>(&key, None) => popped,
                };

                match popped {
                    Ok(Some(payload)) => match serde_json::from_str::<StatusEvent>(&payload) {
                        Ok(event) => {
                            if events.send(event).is_err() {
                                tracing::debug!("Status channel closed, stopping Redis event pump");
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, payload = %payload, "Dropping malformed worker event");
                        }
                    },
                    Ok(None) => {
                        tokio::select! {
                            () = shutdown.cancelled() => break,
                            () = tokio::time::sleep(EVENT_POLL_INTERVAL) => {}
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read worker events");
                        tokio::time::sleep(EVENT_POLL_INTERVAL).await;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl TaskDispatcher for RedisQueueDispatcher {
    async fn submit(&self, request: TaskRequest) -> Result<TaskHandle, DispatchError> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let execution_id = request.execution_id.clone();
        let message = QueuedTask {
            task_id: task_id.clone(),
            request,
            enqueued_at: Utc::now(),
        };
        let payload = serde_json::to_string(&message)?;

        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(self.keys.queue(), payload).await?;

        tracing::debug!(task_id = %task_id, execution_id = %execution_id, "Task pushed to Redis queue");
        Ok(TaskHandle {
            task_id,
            execution_id,
        })
    }

    async fn cancel(&self, handle: &TaskHandle) -> Result<bool, DispatchError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(
            self.keys.revoked(&handle.task_id),
            &handle.execution_id,
            REVOKE_TTL_SECS,
        )
        .await?;
        Ok(false)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

impl fmt::Debug for RedisQueueDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisQueueDispatcher")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}
