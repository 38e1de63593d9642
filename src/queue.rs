//! Durable FIFO upload queue with bounded retry (§4.4).
//!
//! Items are processed one at a time, in enqueue order; a failing item is
//! retried with exponential backoff before the queue gives up and reports it
//! as permanently failed. Progress is observable through an event stream the
//! same way the teacher's import pipeline reports progress through
//! `UploadEvent` over an unbounded channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::config::RetryConfig;
use crate::error::CoreError;
use crate::object_store::ObjectStore;

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub item_id: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    ItemCompleted { item_id: String, locator: String },
    ItemFailed { item_id: String, error: String },
    ItemRetryScheduled { item_id: String, attempt: u32, delay_ms: u64 },
}

/// Computes the backoff delay for a given attempt (0-indexed): doubling from
/// `base_delay_ms`, capped at `max_delay_ms` (§4.4).
fn backoff_delay_ms(attempt: u32, config: &RetryConfig) -> u64 {
    let scaled = config.base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    scaled.min(config.max_delay_ms)
}

/// A single-in-flight, FIFO, durably-backed upload queue. Callers push chunk
/// bytes via [`UploadQueue::enqueue`] and observe outcomes by draining the
/// event receiver returned from [`UploadQueue::spawn`].
pub struct UploadQueue {
    items: Arc<Mutex<VecDeque<QueueItem>>>,
    notify: mpsc::UnboundedSender<()>,
}

impl UploadQueue {
    /// Starts the background worker and returns `(queue_handle, event_rx)`.
    /// The worker processes at most one item at a time, retrying transient
    /// [`CoreError::ObjectStoreFailure`]s per `config` before emitting
    /// `ItemFailed`.
    pub fn spawn(
        object_store: Arc<dyn ObjectStore>,
        config: RetryConfig,
    ) -> (Self, mpsc::UnboundedReceiver<QueueEvent>) {
        let items: Arc<Mutex<VecDeque<QueueItem>>> = Arc::new(Mutex::new(VecDeque::new()));
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<()>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<QueueEvent>();

        let worker_items = items.clone();
        tokio::spawn(async move {
            while notify_rx.recv().await.is_some() {
                loop {
                    let next = worker_items.lock().await.pop_front();
                    let Some(item) = next else { break };
                    Self::process_item(&object_store, &config, item, &event_tx).await;
                }
            }
        });

        (Self { items, notify: notify_tx }, event_rx)
    }

    pub async fn enqueue(&self, item: QueueItem) {
        self.items.lock().await.push_back(item);
        let _ = self.notify.send(());
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    async fn process_item(
        object_store: &Arc<dyn ObjectStore>,
        config: &RetryConfig,
        item: QueueItem,
        event_tx: &mpsc::UnboundedSender<QueueEvent>,
    ) {
        let mut attempt = 0u32;
        loop {
            match object_store.put(&item.bytes).await {
                Ok(locator) => {
                    let _ = event_tx.send(QueueEvent::ItemCompleted {
                        item_id: item.item_id.clone(),
                        locator,
                    });
                    return;
                }
                Err(err) if err.is_transient() && attempt < config.max_retries => {
                    let delay_ms = backoff_delay_ms(attempt, config);
                    let _ = event_tx.send(QueueEvent::ItemRetryScheduled {
                        item_id: item.item_id.clone(),
                        attempt: attempt + 1,
                        delay_ms,
                    });
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
                Err(err) => {
                    let final_error = CoreError::PermanentFailure {
                        retries: attempt,
                        source_error: err.to_string(),
                    };
                    let _ = event_tx.send(QueueEvent::ItemFailed {
                        item_id: item.item_id.clone(),
                        error: final_error.to_string(),
                    });
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::InMemoryObjectStore;

    fn fast_retry_config() -> RetryConfig {
        RetryConfig { max_retries: 5, base_delay_ms: 1, max_delay_ms: 8 }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let config = RetryConfig { max_retries: 5, base_delay_ms: 1000, max_delay_ms: 30_000 };
        assert_eq!(backoff_delay_ms(0, &config), 1000);
        assert_eq!(backoff_delay_ms(1, &config), 2000);
        assert_eq!(backoff_delay_ms(2, &config), 4000);
        assert_eq!(backoff_delay_ms(5, &config), 30_000);
    }

    #[tokio::test]
    async fn successful_upload_emits_completed() {
        let store = Arc::new(InMemoryObjectStore::new());
        let (queue, mut events) = UploadQueue::spawn(store, fast_retry_config());
        queue
            .enqueue(QueueItem { item_id: "chunk-0".into(), bytes: b"hello".to_vec() })
            .await;
        let event = events.recv().await.unwrap();
        assert!(matches!(event, QueueEvent::ItemCompleted { item_id, .. } if item_id == "chunk-0"));
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.set_failing(true);
        let (queue, mut events) = UploadQueue::spawn(store.clone(), fast_retry_config());
        queue
            .enqueue(QueueItem { item_id: "chunk-0".into(), bytes: b"hello".to_vec() })
            .await;

        let first = events.recv().await.unwrap();
        assert!(matches!(first, QueueEvent::ItemRetryScheduled { attempt: 1, .. }));
        store.set_failing(false);

        let mut saw_completed = false;
        for _ in 0..5 {
            match events.recv().await.unwrap() {
                QueueEvent::ItemCompleted { .. } => {
                    saw_completed = true;
                    break;
                }
                QueueEvent::ItemRetryScheduled { .. } => continue,
                QueueEvent::ItemFailed { .. } => break,
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn permanent_failure_after_max_retries_emits_failed() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.set_failing(true);
        let config = RetryConfig { max_retries: 1, base_delay_ms: 1, max_delay_ms: 2 };
        let (queue, mut events) = UploadQueue::spawn(store, config);
        queue
            .enqueue(QueueItem { item_id: "chunk-0".into(), bytes: b"hello".to_vec() })
            .await;

        let mut failed = false;
        for _ in 0..5 {
            if let QueueEvent::ItemFailed { .. } = events.recv().await.unwrap() {
                failed = true;
                break;
            }
        }
        assert!(failed);
    }
}
