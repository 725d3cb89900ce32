use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::future::join_all;
use idranges::{Allocator, MemoryBackend, Range};
use portable_atomic::{AtomicBool, AtomicU64, Ordering};

use super::{config::LoadConfig, telemetry};

/// Outcome of one category after every allocator has stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryReport {
    pub category: String,
    /// IDs handed out across all allocators.
    pub issued: u64,
    /// IDs handed out more than once.
    pub duplicates: u64,
    /// Issued IDs the backend still lists as available.
    pub reissuable: u64,
    /// IDs the backend holds after every allocator returned its leftovers.
    pub remaining: u64,
    /// What `remaining` should be if nothing was lost or double counted.
    pub expected_remaining: u64,
    /// Number of ranges in the final backend state.
    pub ranges: usize,
    pub next_id: Option<u64>,
}

impl CategoryReport {
    pub fn is_consistent(&self) -> bool {
        self.duplicates == 0 && self.reissuable == 0 && self.remaining == self.expected_remaining
    }
}

#[derive(Debug, Clone)]
pub struct LoadReport {
    pub workers: usize,
    pub take_errors: u64,
    pub interrupted: bool,
    pub elapsed: Duration,
    pub categories: Vec<CategoryReport>,
}

impl LoadReport {
    pub fn issued(&self) -> u64 {
        self.categories.iter().map(|c| c.issued).sum()
    }

    pub fn is_consistent(&self) -> bool {
        self.categories.iter().all(CategoryReport::is_consistent)
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} IDs issued by {} allocators in {:.3?}{}",
            self.issued(),
            self.workers,
            self.elapsed,
            if self.interrupted { " (interrupted)" } else { "" }
        )?;
        if self.take_errors > 0 {
            writeln!(f, "{} take_id calls failed", self.take_errors)?;
        }
        for c in &self.categories {
            let next = c
                .next_id
                .map_or_else(|| "none".to_string(), |id| id.to_string());
            writeln!(
                f,
                "  {:<16} issued={} duplicates={} reissuable={} remaining={} expected={} ranges={} next={} {}",
                c.category,
                c.issued,
                c.duplicates,
                c.reissuable,
                c.remaining,
                c.expected_remaining,
                c.ranges,
                next,
                if c.is_consistent() { "ok" } else { "MISMATCH" }
            )?;
        }
        Ok(())
    }
}

/// Runs every allocator to completion (or until `interrupt` is raised),
/// stops them and checks the shared backend against what was issued.
pub async fn run(config: &LoadConfig, interrupt: Arc<AtomicBool>) -> anyhow::Result<LoadReport> {
    let backend = MemoryBackend::new();
    let allocators = (0..config.workers)
        .map(|_| Allocator::new(backend.clone(), config.allocator))
        .collect::<Result<Vec<_>, _>>()?;

    for category in &config.categories {
        allocators[0].initialize(category, config.start_id).await?;
    }

    let take_errors = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    let (interrupt_ref, take_errors_ref) = (&interrupt, &take_errors);
    let tasks = allocators.iter().enumerate().flat_map(|(_worker, allocator)| {
        config.categories.iter().map(move |category| {
            let allocator = allocator.clone();
            let category = category.clone();
            let interrupt = Arc::clone(interrupt_ref);
            let take_errors = Arc::clone(take_errors_ref);
            let takes = config.takes;
            tokio::spawn(async move {
                telemetry::increment_workers_active();
                let ids = take_many(&allocator, &category, takes, &interrupt, &take_errors).await;
                telemetry::decrement_workers_active();

                #[cfg(feature = "tracing")]
                tracing::debug!(worker = _worker, category = %category, issued = ids.len(), "worker finished");
                (category, ids)
            })
        })
    });

    let mut issued: BTreeMap<String, Vec<u64>> = BTreeMap::new();
    for handle in join_all(tasks).await {
        let (category, ids) = handle?;
        issued.entry(category).or_default().extend(ids);
    }
    let elapsed = started.elapsed();

    for (_worker, allocator) in allocators.iter().enumerate() {
        match allocator.stop().await {
            Ok(_version) => {
                #[cfg(feature = "tracing")]
                tracing::info!(worker = _worker, version = ?_version, "allocator stopped");
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::error!(worker = _worker, error = %_err, "allocator failed to stop");
            }
        }
    }

    let initial = (u64::MAX - config.start_id).saturating_add(1);
    let mut categories = Vec::with_capacity(config.categories.len());
    for category in &config.categories {
        let ids = issued.remove(category).unwrap_or_default();
        categories.push(verify(&allocators[0], category, &ids, initial).await?);
    }

    Ok(LoadReport {
        workers: config.workers,
        take_errors: take_errors.load(Ordering::Relaxed),
        interrupted: interrupt.load(Ordering::Relaxed),
        elapsed,
        categories,
    })
}

async fn take_many(
    allocator: &Allocator<MemoryBackend>,
    category: &str,
    takes: u64,
    interrupt: &AtomicBool,
    take_errors: &AtomicU64,
) -> Vec<u64> {
    let mut ids = Vec::with_capacity(usize::try_from(takes).unwrap_or(0));
    for _ in 0..takes {
        if interrupt.load(Ordering::Relaxed) {
            break;
        }
        let start = Instant::now();
        match allocator.take_id(category).await {
            Ok(id) => {
                telemetry::record_take_duration(start.elapsed().as_secs_f64() * 1_000_000.0);
                telemetry::increment_ids_issued(category);
                ids.push(id);
            }
            Err(_err) => {
                telemetry::increment_take_errors(category);
                take_errors.fetch_add(1, Ordering::Relaxed);

                #[cfg(feature = "tracing")]
                tracing::warn!(category, error = %_err, "take_id failed");
            }
        }
    }
    ids
}

async fn verify(
    allocator: &Allocator<MemoryBackend>,
    category: &str,
    ids: &[u64],
    initial: u64,
) -> anyhow::Result<CategoryReport> {
    let mut seen = HashSet::with_capacity(ids.len());
    let duplicates = ids.iter().filter(|id| !seen.insert(**id)).count() as u64;

    let state = allocator.peek_ids(category).await?;
    let (remaining, ranges, next_id, reissuable) = match &state {
        Some(state) => (
            state.total_size(),
            state.ranges().len(),
            state.peek_next().ok(),
            seen.iter()
                .filter(|id| state.validate_no_overlap(&Range::new(**id, **id)).is_err())
                .count() as u64,
        ),
        None => (0, 0, None, 0),
    };

    let issued = ids.len() as u64;
    Ok(CategoryReport {
        category: category.to_string(),
        issued,
        duplicates,
        reissuable,
        remaining,
        expected_remaining: initial.saturating_sub(seen.len() as u64),
        ranges,
        next_id,
    })
}
