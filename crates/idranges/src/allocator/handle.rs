use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
#[cfg(feature = "tracing")]
use tracing::instrument;

use super::{
    dispatcher::{DispatchRequest, Dispatcher},
    exchange::{Exchange, fresh_state},
};
use crate::{AllocatorConfig, Backend, ConcurrentRangeSet, Error, RangeSet, Result};

/// Hands out unique IDs per category by withdrawing batches from a shared
/// [`Backend`].
///
/// Each allocator stands for one process. It keeps at most one batch per
/// category, serves [`Allocator::take_id`] from it and withdraws a fresh
/// batch when it runs dry. Any number of allocators may share a backend:
/// every withdrawal is a conditional write, so two allocators never receive
/// the same ID.
///
/// Batch bookkeeping runs on a dispatcher task owned by the allocator.
/// Handles are cheap to clone and all clones share the dispatcher. Call
/// [`Allocator::stop`] before exiting to return unused IDs; IDs held by an
/// allocator that is dropped without stopping are lost for good.
///
/// # Example
/// ```
/// use idranges::{Allocator, AllocatorConfig, MemoryBackend};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> idranges::Result<()> {
/// let allocator = Allocator::new(MemoryBackend::new(), AllocatorConfig::default())?;
/// allocator.initialize("orders", 1000).await?;
///
/// let batch = allocator.take_ids_with_retry("orders").await?;
/// assert_eq!(batch.take_one().await?, 1000);
///
/// let state = allocator.peek_ids("orders").await?.unwrap();
/// assert_eq!(state.peek_next()?, 1010);
/// assert!(state.is_read_only());
/// # Ok(())
/// # }
/// ```
pub struct Allocator<B: Backend> {
    backend: Arc<B>,
    config: AllocatorConfig,
    requests: mpsc::Sender<DispatchRequest<B::Version>>,
}

impl<B: Backend> Clone for Allocator<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            config: self.config,
            requests: self.requests.clone(),
        }
    }
}

impl<B: Backend> core::fmt::Debug for Allocator<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Allocator")
            .field("config", &self.config)
            .field("stopped", &self.requests.is_closed())
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Allocator<B> {
    /// Creates an allocator over `backend` and spawns its dispatcher.
    ///
    /// # Errors
    /// - [`Error::InvalidConfig`] if `config` fails validation.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    pub fn new(backend: B, config: AllocatorConfig) -> Result<Self> {
        Self::with_shared(Arc::new(backend), config)
    }

    /// Like [`Self::new`] for a backend that is already shared.
    pub fn with_shared(backend: Arc<B>, config: AllocatorConfig) -> Result<Self> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.request_buffer);
        let dispatcher = Dispatcher::new(Exchange::new(Arc::clone(&backend), config));
        tokio::spawn(dispatcher.run(rx));
        Ok(Self {
            backend,
            config,
            requests: tx,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub const fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Returns `true` once the dispatcher has stopped.
    pub fn is_stopped(&self) -> bool {
        self.requests.is_closed()
    }

    /// Creates the stored state of `category` as `[start_id, u64::MAX]`
    /// unless it already holds state.
    ///
    /// Existing state is never reset, even when exhausted. Calls the backend
    /// directly, so it keeps working after [`Self::stop`].
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self)))]
    pub async fn initialize(&self, category: &str, start_id: u64) -> Result<()> {
        if let Some(snapshot) = self.backend.get_data(category).await? {
            if !snapshot.data.is_empty() {
                #[cfg(feature = "tracing")]
                tracing::debug!("category already initialized");
                return Ok(());
            }
        }
        let state = fresh_state(category, start_id);
        self.backend.initialize(&state.to_json()?, category).await
    }

    /// Reads the IDs still available in the backend for `category` without
    /// changing anything.
    ///
    /// Returns a read-only set, or `None` if the category holds no state.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self)))]
    pub async fn peek_ids(&self, category: &str) -> Result<Option<RangeSet>> {
        match self.backend.get_data(category).await? {
            Some(snapshot) if !snapshot.data.is_empty() => {
                let mut state = RangeSet::from_json(&snapshot.data)?;
                state.set_read_only(true);
                Ok(Some(state))
            }
            _ => Ok(None),
        }
    }

    /// Withdraws a fresh batch for `category` and caches it, replacing any
    /// batch already cached. IDs left in a replaced batch are lost.
    ///
    /// # Errors
    /// - [`Error::AllocationFailed`] if every attempt hit a transient
    ///   backend error.
    /// - [`Error::Empty`] if the category is exhausted.
    /// - [`Error::ServiceShutdown`] after [`Self::stop`].
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self)))]
    pub async fn take_ids_with_retry(&self, category: &str) -> Result<ConcurrentRangeSet> {
        let category = category.to_string();
        self.call(|response| DispatchRequest::TakeBatch { category, response })
            .await?
    }

    /// Returns every ID left in the cached batch for `category` to the
    /// backend and drops the batch, yielding the committed version.
    ///
    /// On failure the batch keeps its IDs and stays cached.
    ///
    /// # Errors
    /// - [`Error::NoCachedBatch`], [`Error::ReadOnlyBatch`] or
    ///   [`Error::EmptyBatch`] if there is nothing to return.
    /// - [`Error::MissingState`] if the backend holds no state for
    ///   `category`.
    /// - [`Error::Overlap`] if a returned ID is already available in the
    ///   backend.
    /// - [`Error::PushFailed`] if every attempt hit a transient backend
    ///   error.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self)))]
    pub async fn push_ids_with_retry(&self, category: &str) -> Result<B::Version> {
        let category = category.to_string();
        self.call(|response| DispatchRequest::PushBatch { category, response })
            .await?
    }

    /// Hands out the next ID for `category`, withdrawing a new batch first
    /// when none is cached or the cached one is spent.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    pub async fn take_id(&self, category: &str) -> Result<u64> {
        let category = category.to_string();
        self.call(|response| DispatchRequest::TakeId { category, response })
            .await?
    }

    /// Returns every cached batch to the backend and stops the dispatcher.
    ///
    /// Failures for individual categories are logged and skipped. Yields the
    /// version of the last successful push back, or `None` if nothing was
    /// returned. Afterwards every dispatcher-backed call fails with
    /// [`Error::ServiceShutdown`].
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(self)))]
    pub async fn stop(&self) -> Result<Option<B::Version>> {
        self.call(|response| DispatchRequest::Stop { response })
            .await
    }

    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> DispatchRequest<B::Version>,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(request(tx))
            .await
            .map_err(|_| Error::ServiceShutdown)?;
        rx.await.map_err(|_| Error::ChannelError {
            context: "allocator dispatcher dropped the reply".to_string(),
        })
    }
}
