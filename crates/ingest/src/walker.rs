use std::collections::BTreeSet;
use std::path::Path;

use schemapatch_types::{Commit, FileChange, History, PatchError, Result};
use tracing::debug;

use crate::diff;

/// [`History`] over a local git repository.
pub struct GitHistory {
    repo: git2::Repository,
}

impl GitHistory {
    pub fn open(path: &Path) -> Result<Self> {
        let repo = git2::Repository::open(path)?;
        Ok(GitHistory { repo })
    }

    pub fn from_repository(repo: git2::Repository) -> Self {
        GitHistory { repo }
    }

    /// Every commit reachable from the tip, oldest first. Position + 1 is the sequence id.
    fn walk(&self, branch: Option<&str>) -> Result<Vec<git2::Oid>> {
        let tip = match resolve_tip(&self.repo, branch) {
            Ok(tip) => tip,
            Err(PatchError::Git(e)) if e.code() == git2::ErrorCode::UnbornBranch => {
                debug!("branch has no commits yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut revwalk = self.repo.revwalk()?;
        revwalk.push(tip.id())?;
        revwalk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::REVERSE)?;

        let mut oids = Vec::new();
        for oid in revwalk {
            oids.push(oid?);
        }
        Ok(oids)
    }

    fn to_commit(&self, oid: git2::Oid, sequence_id: u64) -> Result<Commit> {
        let git_commit = self.repo.find_commit(oid)?;
        let author = git_commit.author();

        let message = git_commit.message().unwrap_or("");
        let summary = message.lines().next().unwrap_or("").trim().to_string();

        let changed_files: BTreeSet<String> = diff::commit_files(&self.repo, &git_commit)?
            .into_iter()
            .map(|f| f.path)
            .collect();

        Ok(Commit {
            sequence_id,
            hash: oid.to_string(),
            author: author.name().unwrap_or("").to_string(),
            timestamp: git_commit.time().seconds(),
            summary,
            changed_files,
        })
    }

    fn find_tree(&self, hash: &str) -> Result<git2::Tree<'_>> {
        let oid = git2::Oid::from_str(hash)?;
        Ok(self.repo.find_commit(oid)?.tree()?)
    }
}

impl History for GitHistory {
    fn commits(&self, branch: Option<&str>, max_count: usize) -> Result<Vec<Commit>> {
        let oids = self.walk(branch)?;
        let mut commits = Vec::with_capacity(max_count.min(oids.len()));
        for (idx, oid) in oids.iter().enumerate().rev().take(max_count) {
            commits.push(self.to_commit(*oid, idx as u64 + 1)?);
        }
        debug!(walked = oids.len(), returned = commits.len(), "listed commits");
        Ok(commits)
    }

    fn hash_at(&self, branch: Option<&str>, sequence_id: u64) -> Result<Option<String>> {
        if sequence_id == 0 {
            return Ok(None);
        }
        let oids = self.walk(branch)?;
        oids.get(sequence_id as usize - 1)
            .map(|oid| Some(oid.to_string()))
            .ok_or_else(|| {
                PatchError::Git(git2::Error::from_str(&format!(
                    "no commit with sequence id {} on branch",
                    sequence_id
                )))
            })
    }

    fn diff(&self, from: Option<&str>, to: &str) -> Result<Vec<FileChange>> {
        let old_tree = match from {
            Some(hash) => Some(self.find_tree(hash)?),
            None => None,
        };
        let new_tree = self.find_tree(to)?;
        diff::tree_changes(&self.repo, old_tree.as_ref(), &new_tree)
    }

    fn file_contents(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let tree = self.find_tree(commit)?;
        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let blob = entry.to_object(&self.repo)?.peel_to_blob()?;
        Ok(Some(blob.content().to_vec()))
    }
}

fn resolve_tip<'repo>(
    git_repo: &'repo git2::Repository,
    branch: Option<&str>,
) -> Result<git2::Commit<'repo>> {
    // Try the configured branch first
    if let Some(branch_name) = branch {
        let refname = format!("refs/heads/{}", branch_name);
        if let Ok(obj) = git_repo.revparse_single(&refname) {
            if let Ok(commit) = obj.peel_to_commit() {
                return Ok(commit);
            }
        }
        // Also try the branch name directly (may be a remote ref or short name)
        let obj = git_repo.revparse_single(branch_name)?;
        return Ok(obj.peel_to_commit()?);
    }

    // Fall back to HEAD
    Ok(git_repo.head()?.peel_to_commit()?)
}
