use std::collections::{BTreeMap, BTreeSet};

use schemapatch_types::{Commit, FileChange, FileStatus, History, Result};

/// Builds a commit whose `files` are written with content `<path>@<id>`.
/// A leading `-` marks a deletion.
pub fn commit(id: u64, summary: &str, files: &[&str]) -> Commit {
    Commit {
        sequence_id: id,
        hash: format!("h{}", id),
        author: "Test".into(),
        timestamp: 1_700_000_000 + id as i64,
        summary: summary.into(),
        changed_files: files.iter().map(|f| (*f).to_string()).collect(),
    }
}

/// In-memory history; trees are replayed from the commits' file lists.
pub struct MockHistory {
    /// Oldest first.
    commits: Vec<Commit>,
}

impl MockHistory {
    pub fn new(commits: Vec<Commit>) -> Self {
        MockHistory { commits }
    }

    fn id_of(hash: &str) -> u64 {
        hash.trim_start_matches('h').parse().expect("mock hash")
    }

    fn tree_at(&self, id: u64) -> BTreeMap<String, String> {
        let mut tree = BTreeMap::new();
        for c in self.commits.iter().filter(|c| c.sequence_id <= id) {
            for f in &c.changed_files {
                match f.strip_prefix('-') {
                    Some(path) => {
                        tree.remove(path);
                    }
                    None => {
                        tree.insert(f.clone(), format!("{}@{}", f, c.sequence_id));
                    }
                }
            }
        }
        tree
    }
}

impl History for MockHistory {
    fn commits(&self, _branch: Option<&str>, max_count: usize) -> Result<Vec<Commit>> {
        Ok(self
            .commits
            .iter()
            .rev()
            .take(max_count)
            .map(|c| {
                let mut c = c.clone();
                c.changed_files = c
                    .changed_files
                    .iter()
                    .map(|f| f.trim_start_matches('-').to_string())
                    .collect::<BTreeSet<_>>();
                c
            })
            .collect())
    }

    fn hash_at(&self, _branch: Option<&str>, sequence_id: u64) -> Result<Option<String>> {
        Ok(if sequence_id == 0 {
            None
        } else {
            Some(format!("h{}", sequence_id))
        })
    }

    fn diff(&self, from: Option<&str>, to: &str) -> Result<Vec<FileChange>> {
        let old = from.map(|h| self.tree_at(Self::id_of(h))).unwrap_or_default();
        let new = self.tree_at(Self::id_of(to));
        let mut changes = Vec::new();
        for (path, content) in &new {
            match old.get(path) {
                None => changes.push(FileChange {
                    path: path.clone(),
                    status: FileStatus::Added,
                }),
                Some(prev) if prev != content => changes.push(FileChange {
                    path: path.clone(),
                    status: FileStatus::Modified,
                }),
                Some(_) => {}
            }
        }
        for path in old.keys().filter(|p| !new.contains_key(*p)) {
            changes.push(FileChange {
                path: path.clone(),
                status: FileStatus::Deleted,
            });
        }
        Ok(changes)
    }

    fn file_contents(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .tree_at(Self::id_of(commit))
            .get(path)
            .map(|c| c.as_bytes().to_vec()))
    }
}
