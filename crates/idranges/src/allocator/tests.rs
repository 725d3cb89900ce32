use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use futures::future::join_all;

use crate::{
    Allocator, AllocatorConfig, Backend, Error, MemoryBackend, MemoryLock, Range, RangeSet,
    Result, Snapshot,
};

const CATEGORY: &str = "operation_uid";

/// Wraps a [`MemoryBackend`] and fails a configurable number of reads and
/// conditional writes with a transient error before letting them through.
#[derive(Clone, Default)]
struct FlakyBackend {
    inner: MemoryBackend,
    read_faults: Arc<AtomicU32>,
    write_faults: Arc<AtomicU32>,
    writes: Arc<AtomicU32>,
}

impl FlakyBackend {
    fn fail_reads(&self, n: u32) {
        self.read_faults.store(n, Ordering::SeqCst);
    }

    fn fail_writes(&self, n: u32) {
        self.write_faults.store(n, Ordering::SeqCst);
    }

    fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    fn consume(faults: &AtomicU32) -> bool {
        faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Backend for FlakyBackend {
    type Version = u64;
    type Lock = MemoryLock;

    async fn get_data(&self, category: &str) -> Result<Option<Snapshot<u64>>> {
        if Self::consume(&self.read_faults) {
            return Err(Error::BackendUnavailable {
                reason: "injected read fault".to_string(),
            });
        }
        self.inner.get_data(category).await
    }

    async fn set_data(&self, data: &str, category: &str, expected: &u64) -> Result<u64> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if Self::consume(&self.write_faults) {
            return Err(Error::VersionConflict {
                category: category.to_string(),
            });
        }
        self.inner.set_data(data, category, expected).await
    }

    async fn initialize(&self, data: &str, category: &str) -> Result<()> {
        self.inner.initialize(data, category).await
    }

    async fn delete(&self, category: &str, version: &u64) -> Result<()> {
        self.inner.delete(category, version).await
    }

    async fn lock(&self, category: &str) -> Result<MemoryLock> {
        self.inner.lock(category).await
    }

    async fn unlock(&self, lock: MemoryLock) -> Result<()> {
        self.inner.unlock(lock).await
    }
}

fn allocator() -> Result<(Allocator<MemoryBackend>, MemoryBackend)> {
    let backend = MemoryBackend::new();
    let allocator = Allocator::new(backend.clone(), AllocatorConfig::default())?;
    Ok((allocator, backend))
}

async fn stored<B: Backend>(allocator: &Allocator<B>) -> Result<Vec<Range>> {
    let state = allocator
        .peek_ids(CATEGORY)
        .await?
        .ok_or(Error::MissingState {
            category: CATEGORY.to_string(),
        })?;
    Ok(state.ranges().iter().copied().collect())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn batches_advance_backend_state() -> Result<()> {
    let (allocator, _) = allocator()?;

    let batch = allocator.take_ids_with_retry(CATEGORY).await?;
    assert_eq!(batch.snapshot().await?.ranges(), &vec![Range::new(1, 10)]);
    assert_eq!(stored(&allocator).await?, vec![Range::new(11, u64::MAX)]);

    let batch = allocator.take_ids_with_retry(CATEGORY).await?;
    assert_eq!(batch.snapshot().await?.ranges(), &vec![Range::new(11, 20)]);
    assert_eq!(stored(&allocator).await?, vec![Range::new(21, u64::MAX)]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn initialize_never_resets_state() -> Result<()> {
    let (allocator, _) = allocator()?;
    allocator.initialize(CATEGORY, 1).await?;
    allocator.take_ids_with_retry(CATEGORY).await?;

    allocator.initialize(CATEGORY, 1).await?;
    allocator.initialize(CATEGORY, 5000).await?;
    assert_eq!(stored(&allocator).await?, vec![Range::new(11, u64::MAX)]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn initialize_sets_first_id() -> Result<()> {
    let (allocator, _) = allocator()?;
    allocator.initialize(CATEGORY, 1_000_000).await?;
    assert_eq!(allocator.take_id(CATEGORY).await?, 1_000_000);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn missing_category_starts_at_configured_id() -> Result<()> {
    let backend = MemoryBackend::new();
    let config = AllocatorConfig::default().with_start_id(500);
    let allocator = Allocator::new(backend, config)?;
    assert_eq!(allocator.take_id(CATEGORY).await?, 500);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn empty_record_is_treated_as_missing() -> Result<()> {
    let (allocator, backend) = allocator()?;
    backend.initialize("", CATEGORY).await?;
    assert!(allocator.peek_ids(CATEGORY).await?.is_none());

    assert_eq!(allocator.take_id(CATEGORY).await?, 1);
    assert_eq!(stored(&allocator).await?, vec![Range::new(11, u64::MAX)]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn peek_ids_is_read_only() -> Result<()> {
    let (allocator, _) = allocator()?;
    assert!(allocator.peek_ids(CATEGORY).await?.is_none());

    allocator.initialize(CATEGORY, 1).await?;
    let mut state = allocator.peek_ids(CATEGORY).await?.unwrap();
    assert!(state.is_read_only());
    assert_eq!(state.take_one(), Err(Error::ReadOnly));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn push_returns_unused_ids() -> Result<()> {
    let (allocator, _) = allocator()?;
    let batch = allocator.take_ids_with_retry(CATEGORY).await?;
    for expected in 1..=5 {
        assert_eq!(batch.take_one().await?, expected);
    }

    // initialize = 1, withdraw = 2, push = 3
    assert_eq!(allocator.push_ids_with_retry(CATEGORY).await?, 3);
    assert_eq!(stored(&allocator).await?, vec![Range::new(6, u64::MAX)]);

    assert_eq!(
        allocator.push_ids_with_retry(CATEGORY).await,
        Err(Error::NoCachedBatch {
            category: CATEGORY.to_string()
        })
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn push_rejects_unusable_batches() -> Result<()> {
    let (allocator, _) = allocator()?;
    assert_eq!(
        allocator.push_ids_with_retry(CATEGORY).await,
        Err(Error::NoCachedBatch {
            category: CATEGORY.to_string()
        })
    );

    let batch = allocator.take_ids_with_retry(CATEGORY).await?;
    batch.set_read_only(true).await?;
    assert_eq!(
        allocator.push_ids_with_retry(CATEGORY).await,
        Err(Error::ReadOnlyBatch {
            category: CATEGORY.to_string()
        })
    );

    batch.set_read_only(false).await?;
    batch.take(10).await?;
    assert_eq!(
        allocator.push_ids_with_retry(CATEGORY).await,
        Err(Error::EmptyBatch {
            category: CATEGORY.to_string()
        })
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn repeated_withdrawal_replaces_cached_batch() -> Result<()> {
    let (allocator, _) = allocator()?;
    allocator.take_ids_with_retry(CATEGORY).await?;
    allocator.take_ids_with_retry(CATEGORY).await?;

    // Only the second batch is returned; IDs 1..=10 are gone.
    allocator.push_ids_with_retry(CATEGORY).await?;
    assert_eq!(stored(&allocator).await?, vec![Range::new(11, u64::MAX)]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn take_id_refills_across_batches() -> Result<()> {
    let (allocator, _) = allocator()?;
    for expected in 1..=25 {
        assert_eq!(allocator.take_id(CATEGORY).await?, expected);
    }

    assert!(allocator.stop().await?.is_some());
    assert_eq!(stored(&allocator).await?, vec![Range::new(26, u64::MAX)]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_take_id_issues_unique_ids() -> Result<()> {
    const CALLERS: usize = 1000;
    let (allocator, _) = allocator()?;

    let tasks = (0..CALLERS).map(|_| {
        let allocator = allocator.clone();
        tokio::spawn(async move { allocator.take_id(CATEGORY).await })
    });

    let mut seen = HashSet::new();
    for handle in join_all(tasks).await {
        let id = handle.expect("caller panicked")?;
        assert!(seen.insert(id), "ID {id} issued twice");
    }
    assert_eq!(seen.len(), CALLERS);

    allocator.stop().await?;
    let state = allocator.peek_ids(CATEGORY).await?.unwrap();
    assert_eq!(state.total_size(), u64::MAX - CALLERS as u64);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn allocators_sharing_a_backend_never_collide() -> Result<()> {
    const ALLOCATORS: usize = 4;
    const TAKES: usize = 95;
    let backend = MemoryBackend::new();
    let allocators = (0..ALLOCATORS)
        .map(|_| Allocator::new(backend.clone(), AllocatorConfig::default()))
        .collect::<Result<Vec<_>>>()?;

    let tasks = allocators.iter().cloned().map(|allocator| {
        tokio::spawn(async move {
            let mut ids = Vec::with_capacity(TAKES);
            for _ in 0..TAKES {
                ids.push(allocator.take_id(CATEGORY).await?);
            }
            Ok::<_, Error>(ids)
        })
    });

    let mut seen = HashSet::new();
    for handle in join_all(tasks).await {
        for id in handle.expect("allocator task panicked")? {
            assert!(seen.insert(id), "ID {id} issued twice");
        }
    }

    for allocator in &allocators {
        allocator.stop().await?;
    }
    let state = allocators[0].peek_ids(CATEGORY).await?.unwrap();
    assert_eq!(state.total_size(), u64::MAX - (ALLOCATORS * TAKES) as u64);
    for id in seen {
        assert!(state.validate_no_overlap(&Range::new(id, id)).is_ok());
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn transient_write_conflicts_are_retried() -> Result<()> {
    let backend = FlakyBackend::default();
    let allocator = Allocator::new(backend.clone(), AllocatorConfig::default())?;
    backend.fail_writes(5);

    let batch = allocator.take_ids_with_retry(CATEGORY).await?;
    assert_eq!(batch.size().await?, 10);
    assert_eq!(backend.writes(), 6);
    assert_eq!(stored(&allocator).await?, vec![Range::new(11, u64::MAX)]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn transient_read_failures_are_retried() -> Result<()> {
    let backend = FlakyBackend::default();
    let allocator = Allocator::new(backend.clone(), AllocatorConfig::default())?;
    allocator.initialize(CATEGORY, 1).await?;
    backend.fail_reads(3);

    assert_eq!(allocator.take_id(CATEGORY).await?, 1);
    assert_eq!(backend.writes(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn withdrawal_gives_up_after_attempt_budget() -> Result<()> {
    let backend = FlakyBackend::default();
    let config = AllocatorConfig::default().with_max_attempts(3);
    let allocator = Allocator::new(backend.clone(), config)?;
    backend.fail_writes(u32::MAX);

    let err = allocator.take_ids_with_retry(CATEGORY).await.unwrap_err();
    assert_eq!(
        err,
        Error::AllocationFailed {
            category: CATEGORY.to_string(),
            last: Box::new(Error::VersionConflict {
                category: CATEGORY.to_string()
            }),
        }
    );
    assert_eq!(backend.writes(), 4);
    assert_eq!(stored(&allocator).await?, vec![Range::new(1, u64::MAX)]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn failed_push_keeps_batch_cached() -> Result<()> {
    let backend = FlakyBackend::default();
    let config = AllocatorConfig::default().with_max_attempts(2);
    let allocator = Allocator::new(backend.clone(), config)?;
    let batch = allocator.take_ids_with_retry(CATEGORY).await?;

    backend.fail_writes(u32::MAX);
    let err = allocator.push_ids_with_retry(CATEGORY).await.unwrap_err();
    assert!(matches!(err, Error::PushFailed { .. }));
    assert_eq!(batch.size().await?, 10);
    assert_eq!(stored(&allocator).await?, vec![Range::new(11, u64::MAX)]);

    backend.fail_writes(0);
    allocator.push_ids_with_retry(CATEGORY).await?;
    assert_eq!(stored(&allocator).await?, vec![Range::new(1, u64::MAX)]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn overlapping_push_is_fatal() -> Result<()> {
    let backend = FlakyBackend::default();
    let allocator = Allocator::new(backend.clone(), AllocatorConfig::default())?;
    let batch = allocator.take_ids_with_retry(CATEGORY).await?;

    // Someone else put IDs 1..=10 back behind this allocator's back.
    let snapshot = backend.get_data(CATEGORY).await?.unwrap();
    let reset = RangeSet::new([Range::new(1, u64::MAX)], CATEGORY);
    backend
        .set_data(&reset.to_json()?, CATEGORY, &snapshot.version)
        .await?;
    let writes = backend.writes();

    let err = allocator.push_ids_with_retry(CATEGORY).await.unwrap_err();
    assert!(matches!(err, Error::Overlap { .. }));
    assert_eq!(backend.writes(), writes);
    assert_eq!(batch.size().await?, 10);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn push_without_stored_state_fails() -> Result<()> {
    let (allocator, backend) = allocator()?;
    allocator.take_ids_with_retry(CATEGORY).await?;
    let version = backend.get_data(CATEGORY).await?.unwrap().version;
    backend.delete(CATEGORY, &version).await?;

    assert_eq!(
        allocator.push_ids_with_retry(CATEGORY).await,
        Err(Error::MissingState {
            category: CATEGORY.to_string()
        })
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn malformed_state_is_fatal() -> Result<()> {
    let backend = FlakyBackend::default();
    let allocator = Allocator::new(backend.clone(), AllocatorConfig::default())?;
    backend.initialize("not json", CATEGORY).await?;

    let err = allocator.take_id(CATEGORY).await.unwrap_err();
    assert!(matches!(err, Error::MalformedState { .. }));
    assert_eq!(backend.writes(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn state_of_another_category_is_rejected() -> Result<()> {
    let (allocator, backend) = allocator()?;
    let foreign = RangeSet::new([Range::new(1, 100)], "other");
    backend.initialize(&foreign.to_json()?, CATEGORY).await?;

    let err = allocator.take_id(CATEGORY).await.unwrap_err();
    assert!(matches!(err, Error::CategoryMismatch { .. }));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn exhausted_category_stays_exhausted() -> Result<()> {
    let (allocator, _) = allocator()?;
    allocator.initialize(CATEGORY, u64::MAX - 4).await?;

    let batch = allocator.take_ids_with_retry(CATEGORY).await?;
    assert_eq!(batch.size().await?, 5);
    assert_eq!(
        allocator.take_ids_with_retry(CATEGORY).await.unwrap_err(),
        Error::Empty
    );

    allocator.initialize(CATEGORY, 1).await?;
    assert_eq!(allocator.peek_ids(CATEGORY).await?.unwrap().total_size(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn take_id_reports_exhaustion() -> Result<()> {
    let (allocator, _) = allocator()?;
    allocator.initialize(CATEGORY, u64::MAX - 2).await?;
    for expected in [u64::MAX - 2, u64::MAX - 1, u64::MAX] {
        assert_eq!(allocator.take_id(CATEGORY).await?, expected);
    }
    assert_eq!(allocator.take_id(CATEGORY).await, Err(Error::Empty));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn stop_returns_every_category() -> Result<()> {
    let (allocator, _) = allocator()?;
    for category in ["a", "b", "c"] {
        allocator.take_id(category).await?;
    }

    // Three categories, each: initialize = 1, withdraw = 2, push = 3.
    assert_eq!(allocator.stop().await?, Some(3));
    for category in ["a", "b", "c"] {
        let state = allocator.peek_ids(category).await?.unwrap();
        assert_eq!(state.ranges(), &vec![Range::new(2, u64::MAX)]);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn stop_continues_past_a_failed_category() -> Result<()> {
    let (allocator, backend) = allocator()?;
    for category in ["a", "b", "c"] {
        allocator.take_id(category).await?;
    }

    // Re-list the cached IDs of "c" as available, so returning them overlaps.
    let version = backend.get_data("c").await?.unwrap().version;
    let reset = RangeSet::new([Range::new(1, u64::MAX)], "c");
    let version = backend.set_data(&reset.to_json()?, "c", &version).await?;

    // "c" is returned last and fails; the result is the version committed
    // for "b".
    assert_eq!(allocator.stop().await?, Some(3));
    for category in ["a", "b"] {
        let state = allocator.peek_ids(category).await?.unwrap();
        assert_eq!(state.ranges(), &vec![Range::new(2, u64::MAX)]);
    }
    let snapshot = backend.get_data("c").await?.unwrap();
    assert_eq!(snapshot.version, version);
    assert_eq!(RangeSet::from_json(&snapshot.data)?, reset);
    assert!(allocator.is_stopped());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn stopped_allocator_rejects_requests() -> Result<()> {
    let (allocator, _) = allocator()?;
    let other = allocator.clone();
    allocator.take_id(CATEGORY).await?;
    allocator.stop().await?;

    assert!(other.is_stopped());
    assert_eq!(other.take_id(CATEGORY).await, Err(Error::ServiceShutdown));
    assert_eq!(
        other.take_ids_with_retry(CATEGORY).await.unwrap_err(),
        Error::ServiceShutdown
    );
    assert_eq!(other.stop().await, Err(Error::ServiceShutdown));
    // Direct backend reads keep working.
    assert!(other.peek_ids(CATEGORY).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let config = AllocatorConfig::default().with_batch_size(0);
    let err = Allocator::new(MemoryBackend::new(), config).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig { .. }));
}
