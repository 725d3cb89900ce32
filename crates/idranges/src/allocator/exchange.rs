//! Optimistic read-modify-write cycles against a [`Backend`].
//!
//! Both directions follow the same shape: take the category's advisory lock,
//! then repeatedly read the record, apply the change to the decoded
//! [`RangeSet`] and write it back conditionally on the version that was read.
//! Transient failures restart the cycle until the attempt budget runs out.
//! The lock is released whatever the outcome.

use std::sync::Arc;

use crate::{AllocatorConfig, Backend, Error, Range, RangeSet, Result, Snapshot};

/// Serialized state of a category that has never handed out an ID.
pub(crate) fn fresh_state(category: &str, start_id: u64) -> RangeSet {
    RangeSet::new([Range::new(start_id, u64::MAX)], category)
}

pub(crate) struct Exchange<B: Backend> {
    backend: Arc<B>,
    config: AllocatorConfig,
}

impl<B: Backend> Exchange<B> {
    pub(crate) fn new(backend: Arc<B>, config: AllocatorConfig) -> Self {
        Self { backend, config }
    }

    pub(crate) const fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Removes one batch of `batch_size` IDs from the stored state of
    /// `category` and returns it.
    ///
    /// A category with no stored state is created starting at `start_id`.
    ///
    /// # Errors
    /// - [`Error::AllocationFailed`] once every attempt hit a transient error.
    /// - Any non-transient error immediately, e.g. [`Error::Empty`] when the
    ///   category is exhausted.
    pub(crate) async fn withdraw(&self, category: &str) -> Result<RangeSet> {
        let lock = self.backend.lock(category).await?;
        let mut retries = 0;
        let result = loop {
            match self.try_withdraw(category).await {
                Ok(batch) => break Ok(batch),
                Err(err) => {
                    if let Err(stop) = self.retry(category, err, &mut retries) {
                        break Err(stop.into_error(|last| Error::AllocationFailed {
                            category: category.to_string(),
                            last: Box::new(last),
                        }));
                    }
                }
            }
        };
        self.release(category, lock).await;

        match &result {
            Ok(_batch) => {
                #[cfg(feature = "tracing")]
                tracing::info!(category, batch = %Ranges(_batch), "withdrew ID batch");
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::error!(category, error = %_err, "failed to withdraw ID batch");
            }
        }
        result
    }

    /// Merges `batch` back into the stored state of `category` and returns
    /// the committed version. `batch` itself is never modified.
    ///
    /// # Errors
    /// - [`Error::PushFailed`] once every attempt hit a transient error.
    /// - [`Error::MissingState`] if the category has no stored state.
    /// - [`Error::Overlap`] if any pushed ID is already available in the
    ///   backend.
    pub(crate) async fn deposit(&self, category: &str, batch: &RangeSet) -> Result<B::Version> {
        let lock = self.backend.lock(category).await?;
        let mut retries = 0;
        let result = loop {
            match self.try_deposit(category, batch).await {
                Ok(version) => break Ok(version),
                Err(err) => {
                    if let Err(stop) = self.retry(category, err, &mut retries) {
                        break Err(stop.into_error(|last| Error::PushFailed {
                            category: category.to_string(),
                            last: Box::new(last),
                        }));
                    }
                }
            }
        };
        self.release(category, lock).await;

        match &result {
            Ok(_version) => {
                #[cfg(feature = "tracing")]
                tracing::info!(category, batch = %Ranges(batch), version = ?_version, "pushed ID batch back");
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::error!(category, error = %_err, "failed to push ID batch back");
            }
        }
        result
    }

    // Decides whether a failed attempt may be repeated. Only transient errors
    // are, and only while the attempt budget lasts.
    fn retry(&self, _category: &str, err: Error, retries: &mut u32) -> Result<(), Stop> {
        if !err.is_transient() {
            return Err(Stop::Fatal(err));
        }
        if *retries >= self.config.max_attempts {
            return Err(Stop::Exhausted(err));
        }
        *retries += 1;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            category = _category,
            attempt = *retries + 1,
            error = %err,
            "retrying backend update"
        );
        Ok(())
    }

    async fn try_withdraw(&self, category: &str) -> Result<RangeSet> {
        let snapshot = match self.backend.get_data(category).await? {
            Some(snapshot) => snapshot,
            None => self.create(category).await?,
        };
        let mut state = if snapshot.data.is_empty() {
            fresh_state(category, self.config.start_id)
        } else {
            self.decode(category, &snapshot.data)?
        };

        let batch = state.take(self.config.batch_size)?;
        self.commit(category, &state, &snapshot.version).await?;
        Ok(batch)
    }

    async fn try_deposit(&self, category: &str, batch: &RangeSet) -> Result<B::Version> {
        let snapshot = self
            .backend
            .get_data(category)
            .await?
            .filter(|snapshot| !snapshot.data.is_empty())
            .ok_or_else(|| Error::MissingState {
                category: category.to_string(),
            })?;
        let mut state = self.decode(category, &snapshot.data)?;

        state.push(&mut batch.clone())?;
        self.commit(category, &state, &snapshot.version).await
    }

    async fn create(&self, category: &str) -> Result<Snapshot<B::Version>> {
        #[cfg(feature = "tracing")]
        tracing::info!(
            category,
            start_id = self.config.start_id,
            "no stored state, initializing category"
        );

        let state = fresh_state(category, self.config.start_id);
        self.backend.initialize(&state.to_json()?, category).await?;
        self.backend
            .get_data(category)
            .await?
            .ok_or_else(|| Error::MissingState {
                category: category.to_string(),
            })
    }

    fn decode(&self, category: &str, data: &str) -> Result<RangeSet> {
        let state = RangeSet::from_json(data)?;
        if state.category() != category {
            return Err(Error::CategoryMismatch {
                expected: category.to_string(),
                found: state.category().to_string(),
            });
        }
        Ok(state)
    }

    async fn commit(
        &self,
        category: &str,
        state: &RangeSet,
        expected: &B::Version,
    ) -> Result<B::Version> {
        let written = self
            .backend
            .set_data(&state.to_json()?, category, expected)
            .await;
        if let Err(_err) = &written {
            #[cfg(feature = "tracing")]
            tracing::warn!(category, expected = ?expected, error = %_err, "conditional write rejected");
        }
        written
    }

    async fn release(&self, _category: &str, lock: B::Lock) {
        if let Err(_err) = self.backend.unlock(lock).await {
            #[cfg(feature = "tracing")]
            tracing::warn!(category = _category, error = %_err, "failed to release category lock");
        }
    }
}

enum Stop {
    Fatal(Error),
    Exhausted(Error),
}

impl Stop {
    fn into_error(self, exhausted: impl FnOnce(Error) -> Error) -> Error {
        match self {
            Self::Fatal(err) => err,
            Self::Exhausted(last) => exhausted(last),
        }
    }
}

#[cfg(feature = "tracing")]
struct Ranges<'a>(&'a RangeSet);

#[cfg(feature = "tracing")]
impl core::fmt::Display for Ranges<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("[")?;
        for (i, range) in self.0.ranges().iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{range}")?;
        }
        f.write_str("]")
    }
}
