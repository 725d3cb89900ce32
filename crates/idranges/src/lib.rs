//! # idranges
//!
//! Distributed, range-based unique ID allocation.
//!
//! Independent processes draw non-overlapping `u64` IDs from one logical
//! counter space per *category*. The still-available IDs of a category are
//! stored in a shared, versioned [`Backend`] as a compact [`RangeSet`]; each
//! process withdraws a small batch with an optimistic read-modify-write cycle,
//! hands out IDs locally, and pushes any leftovers back on shutdown.
//!
//! - [`Range`] and [`RangeSet`] implement the interval algebra.
//! - [`ConcurrentRangeSet`] lets many tasks consume one set safely.
//! - [`Allocator`] runs the withdraw/push protocol against a [`Backend`].
//! - [`MemoryBackend`] is an in-process backend for tests and single-node use.
//!
//! ## Example
//! ```
//! use idranges::{Allocator, AllocatorConfig, MemoryBackend};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> idranges::Result<()> {
//! let backend = MemoryBackend::new();
//! let allocator = Allocator::new(backend.clone(), AllocatorConfig::default())?;
//!
//! assert_eq!(allocator.take_id("orders").await?, 1);
//! assert_eq!(allocator.take_id("orders").await?, 2);
//!
//! // Returns IDs 3..=10 to the backend.
//! allocator.stop().await?;
//! let state = allocator.peek_ids("orders").await?.unwrap();
//! assert_eq!(state.peek_next()?, 3);
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//! - `tracing`: emit `tracing` events and spans from the allocator and the
//!   set tasks.

mod allocator;
mod backend;
mod error;
mod range;
mod set;

pub use crate::allocator::*;
pub use crate::backend::*;
pub use crate::error::*;
pub use crate::range::*;
pub use crate::set::*;
