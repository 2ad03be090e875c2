use schemapatch_types::{Commit, CommitRange, History, PatchError, Result};
use tracing::{debug, info};

/// Which commits belong to a patch.
#[derive(Debug, Clone, Default)]
pub struct RangeFilter {
    pub branch: Option<String>,
    pub depth: usize,
    /// Sequence ids always taken, regardless of keywords.
    pub include: Vec<u64>,
    /// Sequence ids never taken, even when included.
    pub exclude: Vec<u64>,
    /// Case-sensitive substrings of the commit summary, OR-combined.
    pub keywords: Vec<String>,
}

impl RangeFilter {
    pub fn is_relevant(&self, commit: &Commit) -> bool {
        if self.exclude.contains(&commit.sequence_id) {
            return false;
        }
        if self.include.contains(&commit.sequence_id) {
            return true;
        }
        self.keywords
            .iter()
            .filter(|k| !k.is_empty())
            .any(|k| commit.summary.contains(k.as_str()))
    }
}

/// Picks the relevant commits among the newest `depth` and derives the diff boundaries.
pub fn resolve(history: &dyn History, filter: &RangeFilter) -> Result<CommitRange> {
    let commits = history.commits(filter.branch.as_deref(), filter.depth)?;
    let scanned = commits.len();

    let relevant: Vec<Commit> = commits
        .into_iter()
        .filter(|c| {
            let keep = filter.is_relevant(c);
            if keep {
                debug!(id = c.sequence_id, summary = %c.summary, "relevant commit");
            }
            keep
        })
        .collect();

    let first = relevant.iter().map(|c| c.sequence_id).min();
    let last = relevant.iter().map(|c| c.sequence_id).max();
    let (first, last) = match (first, last) {
        (Some(first), Some(last)) => (first, last),
        _ => return Err(PatchError::NoCommitsFound),
    };

    info!(
        scanned,
        relevant = relevant.len(),
        first_commit = first - 1,
        last_commit = last,
        "resolved commit range"
    );

    Ok(CommitRange {
        relevant,
        first_commit: first - 1,
        last_commit: last,
    })
}
