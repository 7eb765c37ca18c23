//! Per-counterpart chat channel task registry.
//!
//! Each chat counterpart gets a dedicated `chatUser` channel subscription
//! owned by a background task. Tasks tear their channel down after an idle
//! period; `disconnect`/`close` abort them all immediately.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// One active chat-channel task.
#[derive(Debug)]
pub struct ChatChannelTask {
    /// Subscription id of the counterpart's `chatUser` channel.
    pub channel_id: String,
    handle: JoinHandle<()>,
}

/// Registry of chat-channel tasks keyed by counterpart user id.
#[derive(Debug, Default)]
pub struct ChatChannelTasks {
    tasks: Mutex<HashMap<String, ChatChannelTask>>,
}

impl ChatChannelTasks {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if a task exists for the counterpart.
    pub async fn contains(&self, user_id: &str) -> bool {
        self.tasks.lock().await.contains_key(user_id)
    }

    /// Channel id of the counterpart's active task, if any.
    pub async fn channel_id(&self, user_id: &str) -> Option<String> {
        self.tasks
            .lock()
            .await
            .get(user_id)
            .map(|task| task.channel_id.clone())
    }

    /// Records a task for the counterpart. An existing task for the same
    /// counterpart is aborted and replaced.
    pub async fn insert(&self, user_id: &str, channel_id: String, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().await;
        if let Some(previous) = tasks.insert(
            user_id.to_string(),
            ChatChannelTask { channel_id, handle },
        ) {
            previous.handle.abort();
        }
    }

    /// Removes the counterpart's entry without aborting it, returning its
    /// channel id. Used by a task removing itself on completion.
    pub async fn remove(&self, user_id: &str) -> Option<String> {
        self.tasks
            .lock()
            .await
            .remove(user_id)
            .map(|task| task.channel_id)
    }

    /// Aborts every task immediately and returns the channel ids that were
    /// active. Not a graceful drain.
    pub async fn abort_all(&self) -> Vec<String> {
        let mut tasks = self.tasks.lock().await;
        let mut channel_ids = Vec::with_capacity(tasks.len());
        for (_, task) in tasks.drain() {
            task.handle.abort();
            channel_ids.push(task.channel_id);
        }
        channel_ids
    }

    /// Number of active chat-channel tasks.
    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Returns `true` if no tasks are active.
    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }
}
