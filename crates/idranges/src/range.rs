use core::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A contiguous interval of IDs with a live consumption cursor.
///
/// `start` is both the lower bound and the next ID to hand out: consuming
/// advances `start`, while `end` stays fixed. A range whose `start` has moved
/// past `end` is exhausted and reports a size of zero.
///
/// The read-only flag is local state only. It is never serialized and is
/// ignored by equality, so a range that travels through the wire format
/// always comes back writable.
///
/// # Example
/// ```
/// use idranges::Range;
///
/// let mut range = Range::new(1, 10);
/// let taken = range.take(4).unwrap();
/// assert_eq!((taken.start(), taken.end()), (1, 4));
/// assert_eq!(range.size(), 6);
/// assert_eq!(range.take_one().unwrap(), 5);
/// ```
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Range {
    #[serde(rename = "currentStartID")]
    start: u64,
    #[serde(rename = "endID")]
    end: u64,
    #[serde(skip)]
    read_only: bool,
}

impl Range {
    /// Creates a writable range spanning `[start, end]`.
    pub const fn new(start: u64, end: u64) -> Self {
        Self::with_read_only(start, end, false)
    }

    /// Creates a range spanning `[start, end]` with an explicit read-only
    /// flag.
    pub const fn with_read_only(start: u64, end: u64, read_only: bool) -> Self {
        Self {
            start,
            end,
            read_only,
        }
    }

    /// The next ID this range would hand out.
    pub const fn start(&self) -> u64 {
        self.start
    }

    /// The last ID (inclusive) covered by this range.
    pub const fn end(&self) -> u64 {
        self.end
    }

    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// Number of IDs remaining, or zero once the cursor has passed `end`.
    ///
    /// Saturates at `u64::MAX` for the full `[0, u64::MAX]` span.
    pub const fn size(&self) -> u64 {
        if self.start <= self.end {
            (self.end - self.start).saturating_add(1)
        } else {
            0
        }
    }

    /// Returns `true` while at least one ID remains.
    pub const fn has_more(&self) -> bool {
        self.start <= self.end
    }

    /// Splits the first `n` IDs off the front of this range.
    ///
    /// `n` is clamped to [`Self::size`]. The returned range is writable and
    /// spans `[start, start + n - 1]`; this range's cursor moves past it.
    ///
    /// # Errors
    /// - [`Error::ReadOnly`] if the range is read only.
    /// - [`Error::Empty`] if no IDs remain.
    pub fn take(&mut self, n: u64) -> Result<Self> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let size = self.size();
        if size == 0 {
            return Err(Error::Empty);
        }
        let n = n.min(size);
        if n == 0 {
            return Err(Error::InvalidCount);
        }
        let taken = Self::new(self.start, self.start + (n - 1));
        self.advance(n);
        Ok(taken)
    }

    /// Hands out the ID under the cursor and advances it by one.
    ///
    /// This does **not** check [`Self::has_more`]: on an exhausted range it
    /// returns a value past `end`. Callers must check first, as
    /// [`RangeSet::take_one`](crate::RangeSet::take_one) does.
    ///
    /// # Errors
    /// - [`Error::ReadOnly`] if the range is read only.
    pub fn take_one(&mut self) -> Result<u64> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let id = self.start;
        self.advance(1);
        Ok(id)
    }

    /// Joins `other` onto the end of this range when it starts exactly one
    /// past `self.end`.
    ///
    /// Only this direction is attempted; callers order the arguments.
    pub fn try_merge(&self, other: &Self) -> Option<Self> {
        if self.is_adjacent(other) {
            Some(Self::new(self.start, other.end))
        } else {
            None
        }
    }

    const fn is_adjacent(&self, other: &Self) -> bool {
        match self.end.checked_add(1) {
            Some(next) => next == other.start,
            None => false,
        }
    }

    // A range ending at u64::MAX has no representable cursor past its last
    // ID, so it collapses to an empty sentinel instead.
    fn advance(&mut self, n: u64) {
        match self.start.checked_add(n) {
            Some(start) => self.start = start,
            None => {
                self.start = u64::MAX;
                self.end = u64::MAX - 1;
            }
        }
    }
}

impl PartialEq for Range {
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start && self.end == other.end
    }
}

impl Eq for Range {}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}
