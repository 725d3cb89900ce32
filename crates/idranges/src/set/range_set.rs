use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::{Error, Range, Result};

/// An ordered collection of disjoint [`Range`]s belonging to one category.
///
/// Ranges are kept sorted by start, which is also consumption order. Every
/// insertion merges the new range with its immediate neighbours when they are
/// adjacent, so the set never holds two ranges that could be one.
///
/// The category is fixed at construction and acts as a correctness boundary:
/// [`RangeSet::push`] refuses sets from another category.
///
/// ## Wire format
///
/// ```json
/// {"ranges":[{"currentStartID":1,"endID":1000}],"category":"orders"}
/// ```
///
/// The read-only flag is never serialized, and equality ignores it.
///
/// # Example
/// ```
/// use idranges::{Range, RangeSet};
///
/// let mut state = RangeSet::new([Range::new(1, 1000)], "orders");
/// let mut batch = state.take(10).unwrap();
/// assert_eq!(state.total_size(), 990);
///
/// state.push(&mut batch).unwrap();
/// assert_eq!(state, RangeSet::new([Range::new(1, 1000)], "orders"));
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RangeSet {
    #[serde(default)]
    ranges: VecDeque<Range>,
    #[serde(default)]
    category: String,
    #[serde(skip)]
    read_only: bool,
}

impl RangeSet {
    /// Creates a writable set from `ranges`, sorted by start.
    pub fn new(ranges: impl IntoIterator<Item = Range>, category: impl Into<String>) -> Self {
        Self::with_read_only(ranges, category, false)
    }

    /// Creates a set with an explicit read-only flag.
    ///
    /// Read-only is a property of the whole set: per-range flags on `ranges`
    /// are cleared.
    pub fn with_read_only(
        ranges: impl IntoIterator<Item = Range>,
        category: impl Into<String>,
        read_only: bool,
    ) -> Self {
        let mut set = Self {
            ranges: ranges
                .into_iter()
                .map(|r| Range::new(r.start(), r.end()))
                .collect(),
            category: category.into(),
            read_only,
        };
        set.sort();
        set
    }

    /// An empty, writable set.
    pub fn empty(category: impl Into<String>) -> Self {
        Self::new([], category)
    }

    /// Decodes a set from its wire form.
    ///
    /// The result is always writable.
    ///
    /// # Errors
    /// - [`Error::MalformedState`] if `json` is not a valid encoded set, or if
    ///   two of its ranges share an ID.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut set: Self = serde_json::from_str(json)?;
        set.sort();
        set.validate_disjoint()
            .map_err(|err| Error::MalformedState {
                reason: err.to_string(),
            })?;
        Ok(set)
    }

    /// Encodes the set in its wire form, dropping the read-only flag.
    ///
    /// # Errors
    /// - [`Error::MalformedState`] if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn ranges(&self) -> &VecDeque<Range> {
        &self.ranges
    }

    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// Total number of IDs remaining across all ranges.
    pub fn total_size(&self) -> u64 {
        self.ranges
            .iter()
            .fold(0_u64, |acc, range| acc.saturating_add(range.size()))
    }

    /// Returns `true` while at least one ID remains.
    pub fn has_more(&self) -> bool {
        self.ranges.iter().any(Range::has_more)
    }

    /// Carves up to `n` IDs off the front of the set.
    ///
    /// `n` is clamped to [`Self::total_size`]. The returned set carries the
    /// same category, is writable, and keeps the peeled sub-ranges in order.
    ///
    /// # Errors
    /// - [`Error::ReadOnly`] if the set is read only.
    /// - [`Error::InvalidCount`] if `n` is zero.
    /// - [`Error::Empty`] if the set has no IDs remaining.
    pub fn take(&mut self, n: u64) -> Result<Self> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if n == 0 {
            return Err(Error::InvalidCount);
        }
        let total = self.total_size();
        if total == 0 {
            return Err(Error::Empty);
        }

        let wanted = n.min(total);
        let mut taken = 0_u64;
        let mut peeled = VecDeque::new();
        while taken < wanted {
            let Some(front) = self.ranges.front_mut() else {
                break;
            };
            if !front.has_more() {
                self.ranges.pop_front();
                continue;
            }
            let chunk = (wanted - taken).min(front.size());
            peeled.push_back(front.take(chunk)?);
            taken += chunk;
            if !front.has_more() {
                self.ranges.pop_front();
            }
        }

        Ok(Self {
            ranges: peeled,
            category: self.category.clone(),
            read_only: false,
        })
    }

    /// Hands out the next ID in consumption order.
    ///
    /// # Errors
    /// - [`Error::ReadOnly`] if the set is read only.
    /// - [`Error::Empty`] if the set has no IDs remaining.
    pub fn take_one(&mut self) -> Result<u64> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.drop_exhausted_front();
        let front = self.ranges.front_mut().ok_or(Error::Empty)?;
        let id = front.take_one()?;
        if !front.has_more() {
            self.ranges.pop_front();
        }
        Ok(id)
    }

    /// Reports the next ID without consuming it.
    ///
    /// # Errors
    /// - [`Error::Empty`] if the set has no IDs remaining.
    pub fn peek_next(&self) -> Result<u64> {
        self.ranges
            .iter()
            .find(|range| range.has_more())
            .map(Range::start)
            .ok_or(Error::Empty)
    }

    /// Removes and returns the first range, exhausted or not.
    pub fn pop_front(&mut self) -> Option<Range> {
        self.ranges.pop_front()
    }

    /// Checks that `candidate` shares no ID with any range in the set.
    ///
    /// # Errors
    /// - [`Error::Overlap`] naming the first conflicting range found.
    pub fn validate_no_overlap(&self, candidate: &Range) -> Result<()> {
        let Some(first) = self.ranges.iter().find(|r| r.has_more()) else {
            return Ok(());
        };

        match self.lower(candidate) {
            Some(i) => {
                let lower = &self.ranges[i];
                if lower.end() >= candidate.start() {
                    return Err(self.overlap(candidate, lower));
                }
            }
            None => {
                if first.start() <= candidate.end() {
                    return Err(self.overlap(candidate, first));
                }
            }
        }

        // The two-endpoint neighbour search skips ranges that contain or
        // straddle the candidate. Among ranges starting at or before
        // `candidate.end`, the last live one has the greatest end.
        let upto = self.ranges.partition_point(|r| r.start() <= candidate.end());
        match self.ranges.range(..upto).rev().find(|r| r.has_more()) {
            Some(nearest) if nearest.end() >= candidate.start() => {
                Err(self.overlap(candidate, nearest))
            }
            _ => Ok(()),
        }
    }

    /// Inserts `candidate`, merging it with its lower neighbour and then with
    /// its higher neighbour when they are adjacent.
    ///
    /// The higher merge runs against the possibly already-merged candidate, so
    /// a single call can fuse three ranges into one. Overlap is not checked
    /// here; see [`Self::validate_no_overlap`].
    pub fn add_range(&mut self, candidate: Range) {
        let mut candidate = Range::new(candidate.start(), candidate.end());

        if let Some(i) = self.lower(&candidate) {
            if let Some(merged) = self.ranges[i].try_merge(&candidate) {
                self.ranges.remove(i);
                candidate = merged;
            }
        }

        if let Some(i) = self.higher(&candidate) {
            if let Some(merged) = candidate.try_merge(&self.ranges[i]) {
                self.ranges.remove(i);
                candidate = merged;
            }
        }

        let at = self
            .ranges
            .partition_point(|r| (r.start(), r.end()) < (candidate.start(), candidate.end()));
        self.ranges.insert(at, candidate);
    }

    /// Moves every range of `other` into this set, draining `other`.
    ///
    /// All of `other` is validated before anything moves: on error both sets
    /// are left untouched. Exhausted ranges in `other` are discarded.
    ///
    /// # Errors
    /// - [`Error::CategoryMismatch`] if the categories differ.
    /// - [`Error::ReadOnly`] if either set is read only.
    /// - [`Error::Overlap`] if any range of `other` intersects this set or
    ///   another range of `other`.
    pub fn push(&mut self, other: &mut Self) -> Result<()> {
        if other.category != self.category {
            return Err(Error::CategoryMismatch {
                expected: self.category.clone(),
                found: other.category.clone(),
            });
        }
        if other.read_only || self.read_only {
            return Err(Error::ReadOnly);
        }
        other.validate_disjoint()?;
        for range in other.ranges.iter().filter(|r| r.has_more()) {
            self.validate_no_overlap(range)?;
        }
        while let Some(range) = other.ranges.pop_front() {
            if range.has_more() {
                self.add_range(range);
            }
        }
        Ok(())
    }

    // Checks that no two live ranges of this set share an ID. Relies on the
    // ranges being sorted by start.
    fn validate_disjoint(&self) -> Result<()> {
        let mut live = self.ranges.iter().filter(|r| r.has_more());
        let Some(mut previous) = live.next() else {
            return Ok(());
        };
        for range in live {
            if range.start() <= previous.end() {
                return Err(self.overlap(range, previous));
            }
            previous = range;
        }
        Ok(())
    }

    // Nearest live range strictly below `candidate` on both endpoints.
    // Comparing both endpoints is only meaningful because the set stays sorted
    // and disjoint.
    fn lower(&self, candidate: &Range) -> Option<usize> {
        self.ranges.iter().rposition(|r| {
            r.has_more() && r.start() < candidate.start() && r.end() < candidate.end()
        })
    }

    // Nearest live range strictly above `candidate` on both endpoints.
    fn higher(&self, candidate: &Range) -> Option<usize> {
        self.ranges.iter().position(|r| {
            r.has_more() && r.start() > candidate.start() && r.end() > candidate.end()
        })
    }

    fn drop_exhausted_front(&mut self) {
        while self.ranges.front().is_some_and(|r| !r.has_more()) {
            self.ranges.pop_front();
        }
    }

    fn sort(&mut self) {
        self.ranges
            .make_contiguous()
            .sort_unstable_by_key(|r| (r.start(), r.end()));
    }

    fn overlap(&self, pushed: &Range, existing: &Range) -> Error {
        Error::Overlap {
            pushed: *pushed,
            existing: *existing,
            category: self.category.clone(),
        }
    }
}

impl PartialEq for RangeSet {
    fn eq(&self, other: &Self) -> bool {
        self.category == other.category && self.ranges == other.ranges
    }
}

impl Eq for RangeSet {}
