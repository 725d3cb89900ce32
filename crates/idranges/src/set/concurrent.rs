//! Task-confined sharing for a single [`RangeSet`].
//!
//! A [`ConcurrentRangeSet`] is a cheap, cloneable handle to a Tokio task that
//! exclusively owns one [`RangeSet`]. Every operation is a [`SetRequest`] sent
//! over a bounded [`mpsc`] channel and answered on a [`oneshot`] channel, so
//! the task applies requests strictly one at a time. Operations on one set are
//! therefore linearizable without any lock.
//!
//! The task runs until [`ConcurrentRangeSet::shutdown`] is called or every
//! handle has been dropped.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::{Error, RangeSet, Result};

/// Default capacity of a set's request channel.
pub const DEFAULT_REQUEST_BUFFER: usize = 64;

/// A message sent from a [`ConcurrentRangeSet`] handle to its owning task.
///
/// Each variant carries the reply channel for its result.
#[derive(Debug)]
pub enum SetRequest {
    Size {
        response: oneshot::Sender<u64>,
    },
    Take {
        count: u64,
        response: oneshot::Sender<Result<RangeSet>>,
    },
    TakeOne {
        response: oneshot::Sender<Result<u64>>,
    },
    PeekNext {
        response: oneshot::Sender<Result<u64>>,
    },
    Push {
        set: RangeSet,
        response: oneshot::Sender<Result<()>>,
    },
    PushSerialized {
        data: String,
        response: oneshot::Sender<Result<()>>,
    },
    SetReadOnly {
        read_only: bool,
        response: oneshot::Sender<()>,
    },
    IsReadOnly {
        response: oneshot::Sender<bool>,
    },
    Serialize {
        response: oneshot::Sender<Result<String>>,
    },
    Snapshot {
        response: oneshot::Sender<RangeSet>,
    },
    /// Stop the task after acknowledging on `response`.
    Shutdown { response: oneshot::Sender<()> },
}

/// A [`RangeSet`] shared by any number of concurrent callers.
///
/// Cloning the handle is cheap; all clones talk to the same task.
///
/// # Example
/// ```
/// use idranges::{ConcurrentRangeSet, Range, RangeSet};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> idranges::Result<()> {
/// let set = ConcurrentRangeSet::spawn(RangeSet::new([Range::new(1, 100)], "orders"));
/// assert_eq!(set.take_one().await?, 1);
/// assert_eq!(set.size().await?, 99);
/// set.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct ConcurrentRangeSet {
    requests: mpsc::Sender<SetRequest>,
    category: Arc<str>,
}

impl ConcurrentRangeSet {
    /// Moves `set` into a newly spawned owning task.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    pub fn spawn(set: RangeSet) -> Self {
        Self::spawn_with_buffer(set, DEFAULT_REQUEST_BUFFER)
    }

    /// Like [`Self::spawn`] with an explicit request channel capacity.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime or if `buffer` is zero.
    pub fn spawn_with_buffer(set: RangeSet, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer);
        let category: Arc<str> = Arc::from(set.category());
        tokio::spawn(set_loop(set, rx));
        Self {
            requests: tx,
            category,
        }
    }

    /// Decodes `json` and spawns a task owning the result.
    ///
    /// # Errors
    /// - [`Error::MalformedState`] if `json` is not a valid encoded set.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self::spawn(RangeSet::from_json(json)?))
    }

    /// The category of the owned set. Answered locally.
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Returns `true` once the owning task has stopped.
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    pub async fn size(&self) -> Result<u64> {
        self.call(|response| SetRequest::Size { response }).await
    }

    /// See [`RangeSet::take`].
    pub async fn take(&self, count: u64) -> Result<RangeSet> {
        self.call(|response| SetRequest::Take { count, response })
            .await?
    }

    /// See [`RangeSet::take_one`].
    pub async fn take_one(&self) -> Result<u64> {
        self.call(|response| SetRequest::TakeOne { response })
            .await?
    }

    /// See [`RangeSet::peek_next`].
    pub async fn peek_next(&self) -> Result<u64> {
        self.call(|response| SetRequest::PeekNext { response })
            .await?
    }

    /// Merges `set` into the owned set. See [`RangeSet::push`].
    pub async fn push(&self, set: RangeSet) -> Result<()> {
        self.call(|response| SetRequest::Push { set, response })
            .await?
    }

    /// Decodes `data` inside the owning task and merges it.
    ///
    /// # Errors
    /// - [`Error::MalformedState`] if `data` cannot be decoded, otherwise as
    ///   [`RangeSet::push`].
    pub async fn push_from_serialized(&self, data: impl Into<String>) -> Result<()> {
        let data = data.into();
        self.call(|response| SetRequest::PushSerialized { data, response })
            .await?
    }

    pub async fn set_read_only(&self, read_only: bool) -> Result<()> {
        self.call(|response| SetRequest::SetReadOnly {
            read_only,
            response,
        })
        .await
    }

    pub async fn is_read_only(&self) -> Result<bool> {
        self.call(|response| SetRequest::IsReadOnly { response })
            .await
    }

    /// Encodes the owned set in its wire form.
    pub async fn serialize(&self) -> Result<String> {
        self.call(|response| SetRequest::Serialize { response })
            .await?
    }

    /// A point-in-time copy of the owned set, read-only flag included.
    pub async fn snapshot(&self) -> Result<RangeSet> {
        self.call(|response| SetRequest::Snapshot { response })
            .await
    }

    /// Stops the owning task and waits for its acknowledgement.
    ///
    /// Requests queued behind the shutdown are dropped and their callers
    /// receive [`Error::ChannelError`]; later calls fail with
    /// [`Error::ServiceShutdown`].
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|response| SetRequest::Shutdown { response })
            .await
    }

    async fn call<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> SetRequest) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(request(tx))
            .await
            .map_err(|_| Error::ServiceShutdown)?;
        rx.await.map_err(|_| Error::ChannelError {
            context: format!("range set '{}' dropped the reply", self.category),
        })
    }
}

/// Owning task for one [`RangeSet`].
///
/// Replies are best effort: a caller that stopped waiting simply misses its
/// answer, the mutation has still been applied.
async fn set_loop(mut set: RangeSet, mut rx: mpsc::Receiver<SetRequest>) {
    #[cfg(feature = "tracing")]
    tracing::trace!(category = set.category(), "range set task started");

    while let Some(request) = rx.recv().await {
        match request {
            SetRequest::Size { response } => {
                let _ = response.send(set.total_size());
            }
            SetRequest::Take { count, response } => {
                let _ = response.send(set.take(count));
            }
            SetRequest::TakeOne { response } => {
                let _ = response.send(set.take_one());
            }
            SetRequest::PeekNext { response } => {
                let _ = response.send(set.peek_next());
            }
            SetRequest::Push {
                set: mut pushed,
                response,
            } => {
                let _ = response.send(set.push(&mut pushed));
            }
            SetRequest::PushSerialized { data, response } => {
                let result = RangeSet::from_json(&data).and_then(|mut pushed| set.push(&mut pushed));
                let _ = response.send(result);
            }
            SetRequest::SetReadOnly {
                read_only,
                response,
            } => {
                set.set_read_only(read_only);
                let _ = response.send(());
            }
            SetRequest::IsReadOnly { response } => {
                let _ = response.send(set.is_read_only());
            }
            SetRequest::Serialize { response } => {
                let _ = response.send(set.to_json());
            }
            SetRequest::Snapshot { response } => {
                let _ = response.send(set.clone());
            }
            SetRequest::Shutdown { response } => {
                #[cfg(feature = "tracing")]
                tracing::trace!(category = set.category(), "range set received shutdown");

                rx.close();
                if response.send(()).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        category = set.category(),
                        "range set shutdown acknowledgement dropped"
                    );
                }
                break;
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!(category = set.category(), "range set task stopped");
}
