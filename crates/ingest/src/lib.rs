mod changes;
mod diff;
mod range;
mod walker;

#[cfg(test)]
mod testutil;

pub use changes::{extract, is_candidate};
pub use range::{resolve, RangeFilter};
pub use walker::GitHistory;
