use core::fmt::Debug;
use core::future::Future;

use crate::Result;

/// The stored state of one category as last read from a [`Backend`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot<V> {
    /// The serialized [`RangeSet`](crate::RangeSet). An empty string means no
    /// state has been written yet.
    pub data: String,
    /// Opaque token identifying this revision of the record.
    pub version: V,
}

/// A shared, versioned key-value store coordinating allocators across
/// processes.
///
/// Each category maps to a single record holding a serialized
/// [`RangeSet`](crate::RangeSet) and a version token. Records are only ever
/// replaced through [`Backend::set_data`], which must reject the write when the
/// stored version no longer matches `expected`; this conditional write is what
/// makes concurrent withdrawals safe.
///
/// The advisory [`Backend::lock`] only reduces contention between allocators.
/// Correctness never depends on it.
///
/// Implementations should report a stale version as
/// [`Error::VersionConflict`](crate::Error::VersionConflict) and connectivity
/// problems as
/// [`Error::BackendUnavailable`](crate::Error::BackendUnavailable); both are
/// retried by the allocator.
pub trait Backend: Send + Sync + 'static {
    /// Version token attached to every record.
    type Version: Clone + Debug + Send + Sync + 'static;

    /// Handle proving a held lock, released by [`Backend::unlock`].
    type Lock: Send + 'static;

    /// Reads the record for `category`, or `None` if it does not exist.
    fn get_data(
        &self,
        category: &str,
    ) -> impl Future<Output = Result<Option<Snapshot<Self::Version>>>> + Send;

    /// Replaces the record for `category` if its version is still
    /// `expected`, returning the new version.
    fn set_data(
        &self,
        data: &str,
        category: &str,
        expected: &Self::Version,
    ) -> impl Future<Output = Result<Self::Version>> + Send;

    /// Creates the record for `category` if absent. An existing record is
    /// left untouched.
    fn initialize(&self, data: &str, category: &str) -> impl Future<Output = Result<()>> + Send;

    /// Removes the record for `category` if its version is still `version`.
    fn delete(
        &self,
        category: &str,
        version: &Self::Version,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Acquires the advisory lock for `category`, waiting if it is held.
    fn lock(&self, category: &str) -> impl Future<Output = Result<Self::Lock>> + Send;

    /// Releases a lock returned by [`Backend::lock`].
    fn unlock(&self, lock: Self::Lock) -> impl Future<Output = Result<()>> + Send;
}
