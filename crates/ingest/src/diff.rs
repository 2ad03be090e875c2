use schemapatch_types::{FileChange, FileStatus, Result};

/// Changes introduced by `commit` against its first parent (or the empty tree).
pub fn commit_files(repo: &git2::Repository, commit: &git2::Commit) -> Result<Vec<FileChange>> {
    let parent_tree = if commit.parent_count() > 0 {
        Some(commit.parent(0)?.tree()?)
    } else {
        None
    };
    let commit_tree = commit.tree()?;
    tree_changes(repo, parent_tree.as_ref(), &commit_tree)
}

/// Net changes between two trees. No rename detection: a move is a delete plus an add.
pub fn tree_changes(
    repo: &git2::Repository,
    old_tree: Option<&git2::Tree>,
    new_tree: &git2::Tree,
) -> Result<Vec<FileChange>> {
    let diff = repo.diff_tree_to_tree(old_tree, Some(new_tree), None)?;

    let mut files = Vec::new();
    for delta in diff.deltas() {
        let status = delta.status();

        let path = match status {
            git2::Delta::Deleted => delta.old_file().path(),
            _ => delta.new_file().path().or_else(|| delta.old_file().path()),
        };

        let path_str = match path.and_then(|p| p.to_str()) {
            Some(s) => s.to_string(),
            None => continue,
        };

        let file_status = match status {
            git2::Delta::Added | git2::Delta::Untracked => FileStatus::Added,
            git2::Delta::Modified | git2::Delta::Typechange => FileStatus::Modified,
            git2::Delta::Deleted => FileStatus::Deleted,
            git2::Delta::Renamed => FileStatus::Renamed,
            git2::Delta::Copied => FileStatus::Copied,
            _ => FileStatus::Unknown,
        };

        files.push(FileChange {
            path: path_str,
            status: file_status,
        });
    }

    Ok(files)
}
