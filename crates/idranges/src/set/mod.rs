mod concurrent;
mod range_set;

pub use concurrent::*;
pub use range_set::*;
