use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::{Backend, Error, Result, Snapshot};

#[derive(Clone, Debug)]
struct Record {
    data: String,
    version: u64,
}

/// An in-process [`Backend`] keeping every record in memory.
///
/// Clones share the same state, so several [`Allocator`](crate::Allocator)s
/// built from clones of one `MemoryBackend` behave like separate processes
/// talking to one store.
///
/// Versions start at `1` when a record is created and increase by one with
/// each successful conditional write.
#[derive(Clone, Debug, Default)]
pub struct MemoryBackend {
    records: Arc<Mutex<HashMap<String, Record>>>,
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

/// A held per-category lock on a [`MemoryBackend`].
#[derive(Debug)]
pub struct MemoryLock {
    category: String,
    _guard: OwnedMutexGuard<()>,
}

impl MemoryLock {
    pub fn category(&self) -> &str {
        &self.category
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of categories with a stored record.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn category_lock(&self, category: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(category.to_string())
            .or_default()
            .clone()
    }
}

impl Backend for MemoryBackend {
    type Version = u64;
    type Lock = MemoryLock;

    async fn get_data(&self, category: &str) -> Result<Option<Snapshot<u64>>> {
        Ok(self.records.lock().get(category).map(|record| Snapshot {
            data: record.data.clone(),
            version: record.version,
        }))
    }

    async fn set_data(&self, data: &str, category: &str, expected: &u64) -> Result<u64> {
        let mut records = self.records.lock();
        match records.get_mut(category) {
            Some(record) if record.version == *expected => {
                record.data = data.to_string();
                record.version += 1;
                Ok(record.version)
            }
            _ => Err(Error::VersionConflict {
                category: category.to_string(),
            }),
        }
    }

    async fn initialize(&self, data: &str, category: &str) -> Result<()> {
        self.records
            .lock()
            .entry(category.to_string())
            .or_insert_with(|| Record {
                data: data.to_string(),
                version: 1,
            });
        Ok(())
    }

    async fn delete(&self, category: &str, version: &u64) -> Result<()> {
        let mut records = self.records.lock();
        match records.get(category) {
            None => Ok(()),
            Some(record) if record.version == *version => {
                records.remove(category);
                Ok(())
            }
            Some(_) => Err(Error::VersionConflict {
                category: category.to_string(),
            }),
        }
    }

    async fn lock(&self, category: &str) -> Result<MemoryLock> {
        let guard = self.category_lock(category).lock_owned().await;
        Ok(MemoryLock {
            category: category.to_string(),
            _guard: guard,
        })
    }

    async fn unlock(&self, lock: MemoryLock) -> Result<()> {
        drop(lock);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const CATEGORY: &str = "operation_uid";

    #[tokio::test]
    async fn absent_record_reads_none() -> Result<()> {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get_data(CATEGORY).await?, None);
        assert!(backend.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn initialize_is_create_if_absent() -> Result<()> {
        let backend = MemoryBackend::new();
        backend.initialize("first", CATEGORY).await?;
        backend.initialize("second", CATEGORY).await?;
        let snapshot = backend.get_data(CATEGORY).await?.unwrap();
        assert_eq!(
            snapshot,
            Snapshot {
                data: "first".to_string(),
                version: 1
            }
        );
        assert_eq!(backend.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn set_data_is_conditional_on_version() -> Result<()> {
        let backend = MemoryBackend::new();
        backend.initialize("v1", CATEGORY).await?;

        assert_eq!(backend.set_data("v2", CATEGORY, &1).await?, 2);
        assert_eq!(
            backend.set_data("stale", CATEGORY, &1).await,
            Err(Error::VersionConflict {
                category: CATEGORY.to_string()
            })
        );
        let snapshot = backend.get_data(CATEGORY).await?.unwrap();
        assert_eq!(snapshot.data, "v2");
        assert_eq!(snapshot.version, 2);
        Ok(())
    }

    #[tokio::test]
    async fn set_data_on_absent_record_conflicts() {
        let backend = MemoryBackend::new();
        let err = backend.set_data("x", CATEGORY, &1).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn delete_is_conditional_on_version() -> Result<()> {
        let backend = MemoryBackend::new();
        backend.delete(CATEGORY, &1).await?;

        backend.initialize("v1", CATEGORY).await?;
        assert!(backend.delete(CATEGORY, &7).await.is_err());
        backend.delete(CATEGORY, &1).await?;
        assert_eq!(backend.get_data(CATEGORY).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn clones_share_state() -> Result<()> {
        let backend = MemoryBackend::new();
        let other = backend.clone();
        backend.initialize("shared", CATEGORY).await?;
        assert_eq!(other.get_data(CATEGORY).await?.unwrap().data, "shared");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn lock_excludes_until_unlocked() -> Result<()> {
        let backend = MemoryBackend::new();
        let held = backend.lock(CATEGORY).await?;
        assert_eq!(held.category(), CATEGORY);

        let contender = backend.clone();
        let waiter = tokio::spawn(async move { contender.lock(CATEGORY).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        // Other categories are independent.
        let unrelated = backend.lock("other").await?;
        backend.unlock(unrelated).await?;

        backend.unlock(held).await?;
        let acquired = waiter.await.expect("waiter panicked")?;
        backend.unlock(acquired).await?;
        Ok(())
    }
}
