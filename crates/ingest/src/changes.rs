use std::collections::BTreeSet;

use schemapatch_types::{
    ChangeSet, CommitRange, FileStatus, History, PathsConfig, PatchError, Result,
};
use tracing::{debug, info};

/// `.sql` files under the object or application-export roots.
pub fn is_candidate(path: &str, paths: &PathsConfig) -> bool {
    if !path.ends_with(".sql") {
        return false;
    }
    let object_prefix = paths.object_prefix();
    let app_prefix = paths.app_prefix();
    path.starts_with(&object_prefix) || path.starts_with(&app_prefix)
}

/// Net diff between the range boundaries, limited to files the relevant commits touched.
pub fn extract(
    history: &dyn History,
    branch: Option<&str>,
    range: &CommitRange,
    paths: &PathsConfig,
) -> Result<ChangeSet> {
    let candidates: BTreeSet<&str> = range
        .relevant
        .iter()
        .flat_map(|c| c.changed_files.iter())
        .filter(|p| is_candidate(p, paths))
        .map(String::as_str)
        .collect();

    let commits = range
        .relevant
        .iter()
        .filter(|c| c.changed_files.iter().any(|p| candidates.contains(p.as_str())))
        .cloned()
        .collect();

    let from = history.hash_at(branch, range.first_commit)?;
    let to = history.hash_at(branch, range.last_commit)?.ok_or(PatchError::NoCommitsFound)?;

    let mut change_set = ChangeSet {
        commits,
        last_hash: to.clone(),
        ..ChangeSet::default()
    };

    for change in history.diff(from.as_deref(), &to)? {
        if !candidates.contains(change.path.as_str()) {
            continue;
        }
        debug!(path = %change.path, status = %change.status, "changed file");
        match change.status {
            FileStatus::Added | FileStatus::Renamed | FileStatus::Copied => {
                change_set.added.push(change.path)
            }
            FileStatus::Modified | FileStatus::Unknown => change_set.modified.push(change.path),
            FileStatus::Deleted => change_set.deleted.push(change.path),
        }
    }

    change_set.added.sort();
    change_set.modified.sort();
    change_set.deleted.sort();

    info!(
        added = change_set.added.len(),
        modified = change_set.modified.len(),
        deleted = change_set.deleted.len(),
        candidates = candidates.len(),
        "extracted change set"
    );
    Ok(change_set)
}
