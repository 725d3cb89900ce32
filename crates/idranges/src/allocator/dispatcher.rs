use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};

use super::exchange::Exchange;
use crate::{Backend, ConcurrentRangeSet, Error, Result};

/// A message sent from an [`Allocator`](crate::Allocator) handle to its
/// dispatcher task.
#[derive(Debug)]
pub(crate) enum DispatchRequest<V> {
    TakeId {
        category: String,
        response: oneshot::Sender<Result<u64>>,
    },
    TakeBatch {
        category: String,
        response: oneshot::Sender<Result<ConcurrentRangeSet>>,
    },
    PushBatch {
        category: String,
        response: oneshot::Sender<Result<V>>,
    },
    /// Push every cached batch back, reply with the last committed version,
    /// then exit.
    Stop {
        response: oneshot::Sender<Option<V>>,
    },
}

/// Owner of the per-category batch cache.
///
/// Only the dispatcher task touches the cache, so refills and push-backs for
/// one allocator never interleave.
pub(crate) struct Dispatcher<B: Backend> {
    exchange: Exchange<B>,
    batches: HashMap<String, ConcurrentRangeSet>,
}

impl<B: Backend> Dispatcher<B> {
    pub(crate) fn new(exchange: Exchange<B>) -> Self {
        Self {
            exchange,
            batches: HashMap::new(),
        }
    }

    /// Runs until a [`DispatchRequest::Stop`] is handled or every handle has
    /// been dropped.
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<DispatchRequest<B::Version>>) {
        #[cfg(feature = "tracing")]
        tracing::trace!("allocator dispatcher started");

        while let Some(request) = rx.recv().await {
            match request {
                DispatchRequest::TakeId { category, response } => {
                    let _ = response.send(self.take_id(&category).await);
                }
                DispatchRequest::TakeBatch { category, response } => {
                    let _ = response.send(self.refill(&category).await);
                }
                DispatchRequest::PushBatch { category, response } => {
                    let _ = response.send(self.push_back(&category).await);
                }
                DispatchRequest::Stop { response } => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        categories = self.batches.len(),
                        "allocator dispatcher received stop"
                    );

                    rx.close();
                    let version = self.push_back_all().await;
                    if response.send(version).is_err() {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("allocator stop acknowledgement dropped");
                    }
                    break;
                }
            }
        }

        #[cfg(feature = "tracing")]
        tracing::trace!("allocator dispatcher stopped");
    }

    async fn take_id(&mut self, category: &str) -> Result<u64> {
        let batch = match self.live_batch(category).await {
            Some(batch) => batch,
            None => self.refill(category).await?,
        };
        batch.take_one().await
    }

    // The cached batch for `category` if it still holds IDs. A batch whose
    // task was shut down from outside counts as spent.
    async fn live_batch(&self, category: &str) -> Option<ConcurrentRangeSet> {
        let batch = self.batches.get(category)?;
        match batch.size().await {
            Ok(size) if size > 0 => Some(batch.clone()),
            _ => None,
        }
    }

    async fn refill(&mut self, category: &str) -> Result<ConcurrentRangeSet> {
        let batch = self.exchange.withdraw(category).await?;
        let batch =
            ConcurrentRangeSet::spawn_with_buffer(batch, self.exchange.config().request_buffer);

        if let Some(previous) = self.batches.insert(category.to_string(), batch.clone()) {
            let leaked = previous.size().await.unwrap_or(0);
            if leaked > 0 {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    category,
                    leaked,
                    "replaced a cached batch that still held IDs; they will not be returned"
                );
            }
        }
        Ok(batch)
    }

    async fn push_back(&mut self, category: &str) -> Result<B::Version> {
        let batch = self
            .batches
            .get(category)
            .cloned()
            .ok_or_else(|| Error::NoCachedBatch {
                category: category.to_string(),
            })?;

        // Drain in one request so no ID can be issued from the batch while
        // it is being returned.
        let drained = batch.take(u64::MAX).await.map_err(|err| match err {
            Error::ReadOnly => Error::ReadOnlyBatch {
                category: category.to_string(),
            },
            Error::Empty => Error::EmptyBatch {
                category: category.to_string(),
            },
            err => err,
        })?;

        match self.exchange.deposit(category, &drained).await {
            Ok(version) => {
                self.batches.remove(category);
                Ok(version)
            }
            Err(err) => {
                if let Err(_restore) = batch.push(drained).await {
                    #[cfg(feature = "tracing")]
                    tracing::error!(
                        category,
                        error = %_restore,
                        "failed to restore batch after unsuccessful push back"
                    );
                }
                Err(err)
            }
        }
    }

    async fn push_back_all(&mut self) -> Option<B::Version> {
        let mut categories: Vec<String> = self.batches.keys().cloned().collect();
        categories.sort_unstable();

        let mut last = None;
        for category in categories {
            match self.push_back(&category).await {
                Ok(version) => last = Some(version),
                Err(Error::EmptyBatch { .. }) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(category, "cached batch fully consumed, nothing to return");
                }
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(category, error = %_err, "failed to return batch on stop");
                }
            }
        }
        last
    }
}
