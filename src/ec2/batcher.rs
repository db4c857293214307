//! Describe-call coalescing.
//!
//! Concurrent operations frequently describe different volumes within the
//! same few hundred milliseconds. The batcher queues those requests, issues
//! one DescribeVolumes for up to 200 ids per call, and fans the per-id
//! results back to the waiters. Without it, a busy cluster turns every
//! reconcile pass into an EC2 throttling cascade.

use std::{collections::HashMap, future::Future};

use tokio::{
    sync::{mpsc, oneshot},
    time::{timeout_at, Duration, Instant},
};

use crate::errors::{Error, Result};

/// Collection window before a partial batch flushes.
pub const BATCH_WINDOW: Duration = Duration::from_millis(300);
/// Pending-request count that flushes immediately.
pub const BATCH_FLUSH_COUNT: usize = 50;
/// Upper bound on ids per describe call.
pub const BATCH_MAX_IDS: usize = 200;

struct BatchRequest<T> {
    id: String,
    reply: oneshot::Sender<Result<T>>,
}

/// Handle for submitting coalesced lookups. Cloning is cheap; dropping all
/// handles stops the background task.
pub struct Batcher<T> {
    tx: mpsc::Sender<BatchRequest<T>>,
}

impl<T> Clone for Batcher<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> Batcher<T> {
    /// Spawns the coalescing task around "describe", which maps a set of
    /// ids to per-id results in one backend call.
    pub fn spawn<F, Fut>(window: Duration, flush_count: usize, max_ids: usize, describe: F) -> Self
    where
        F: Fn(Vec<String>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<HashMap<String, T>>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<BatchRequest<T>>(flush_count * 4);

        tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                let mut pending = vec![first];
                let deadline = Instant::now() + window;

                while pending.len() < flush_count {
                    match timeout_at(deadline, rx.recv()).await {
                        Ok(Some(req)) => pending.push(req),
                        // channel closed or window expired: flush what we have
                        Ok(None) => break,
                        Err(_) => break,
                    }
                }

                for chunk in chunks(pending, max_ids) {
                    let ids: Vec<String> = chunk.iter().map(|r| r.id.clone()).collect();
                    log::debug!("describing {} coalesced ids", ids.len());
                    match describe(ids).await {
                        Ok(mut results) => {
                            for req in chunk {
                                let reply = match results.remove(&req.id) {
                                    Some(v) => Ok(v),
                                    None => Err(Error::not_found(
                                        req.id.clone(),
                                        "absent from describe results",
                                    )),
                                };
                                let _ = req.reply.send(reply);
                            }
                        }
                        Err(e) => {
                            let (message, retryable) = (e.message(), e.retryable());
                            for req in chunk {
                                let _ = req.reply.send(Err(Error::Other {
                                    message: message.clone(),
                                    retryable,
                                }));
                            }
                        }
                    }
                }
            }
        });

        Self { tx }
    }

    /// Submits one id and waits for its slice of the batched result.
    pub async fn get(&self, id: &str) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BatchRequest {
                id: id.to_string(),
                reply,
            })
            .await
            .map_err(|_| Error::internal("describe batcher stopped"))?;
        rx.await
            .map_err(|_| Error::internal("describe batcher dropped the request"))?
    }
}

fn chunks<T>(mut items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let mut out = Vec::new();
    while items.len() > size {
        let rest = items.split_off(size);
        out.push(items);
        items = rest;
    }
    if !items.is_empty() {
        out.push(items);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn spawn_counting(
        calls: Arc<AtomicUsize>,
    ) -> Batcher<String> {
        Batcher::spawn(
            Duration::from_millis(20),
            BATCH_FLUSH_COUNT,
            BATCH_MAX_IDS,
            move |ids| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok(ids
                        .into_iter()
                        .filter(|id| id != "vol-missing")
                        .map(|id| (id.clone(), format!("state-of-{}", id)))
                        .collect())
                }
            },
        )
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let batcher = spawn_counting(Arc::clone(&calls));

        let mut handles = Vec::new();
        for i in 0..10 {
            let batcher = batcher.clone();
            handles.push(tokio::spawn(async move {
                batcher.get(&format!("vol-{}", i)).await.unwrap()
            }));
        }
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.await.unwrap(), format!("state-of-vol-{}", i));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_id_resolves_not_found() {
        let calls = Arc::new(AtomicUsize::new(0));
        let batcher = spawn_counting(calls);

        let err = batcher.get("vol-missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn backend_error_reaches_every_waiter() {
        let batcher: Batcher<String> = Batcher::spawn(
            Duration::from_millis(20),
            BATCH_FLUSH_COUNT,
            BATCH_MAX_IDS,
            |_ids| async {
                Err(Error::API {
                    message: "RequestLimitExceeded".to_string(),
                    retryable: true,
                })
            },
        );

        let a = batcher.get("vol-1");
        let b = batcher.get("vol-2");
        let (ra, rb) = tokio::join!(a, b);
        assert!(ra.unwrap_err().retryable());
        assert!(rb.unwrap_err().retryable());
    }

    #[test]
    fn chunking_preserves_order_and_bounds() {
        let split = chunks((0..5).collect::<Vec<_>>(), 2);
        assert_eq!(split, vec![vec![0, 1], vec![2, 3], vec![4]]);
        let whole = chunks(vec![1], 10);
        assert_eq!(whole, vec![vec![1]]);
    }
}
