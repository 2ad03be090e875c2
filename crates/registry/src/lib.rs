//! Patch folders on disk, read back into an immutable snapshot.
//!
//! The patch root is the only record of what was built and deployed: script
//! headers carry the commits, `@"./..."` lines carry the files, and result
//! log names carry every deployment attempt. [`Registry::scan`] turns that
//! into numbered [`PatchReference`]s, newest folder first.

mod header;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use schemapatch_types::{DeployResult, DeploymentLogEntry, PatchError, PatchIdentity, Result};
use serde::Serialize;
use tracing::{debug, warn};

pub use header::{parse_commits, parse_references};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchReference {
    /// 1 for the most recently created folder.
    #[serde(rename = "ref")]
    pub reference: usize,
    pub identity: PatchIdentity,
    pub folder: PathBuf,
    /// Script file names, sorted.
    pub scripts: Vec<String>,
    pub files: BTreeSet<String>,
    pub commits: BTreeSet<u64>,
    pub logs: Vec<DeploymentLogEntry>,
    pub deployed_at: Option<String>,
    pub result: Option<DeployResult>,
}

impl PatchReference {
    pub fn is_deployed(&self) -> bool {
        self.deployed_at.is_some()
    }
}

/// A newer, already deployed patch sharing files with the one requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    #[serde(rename = "ref")]
    pub reference: usize,
    pub identity: PatchIdentity,
    pub deployed_at: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    root: PathBuf,
    patches: BTreeMap<usize, PatchReference>,
}

impl Registry {
    /// Reads every patch folder under `patch_root`. A missing root is an empty registry.
    pub fn scan(patch_root: &Path) -> Result<Self> {
        let mut folders = list_folders(patch_root)?;
        folders.sort_by(|a, b| b.0.cmp(&a.0));

        let mut patches = BTreeMap::new();
        for (idx, (name, identity)) in folders.into_iter().enumerate() {
            let reference = idx + 1;
            let patch = read_patch(reference, identity, &patch_root.join(&name))?;
            debug!(
                reference,
                folder = %name,
                scripts = patch.scripts.len(),
                logs = patch.logs.len(),
                "scanned patch"
            );
            patches.insert(reference, patch);
        }

        Ok(Registry {
            root: patch_root.to_path_buf(),
            patches,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, reference: usize) -> Option<&PatchReference> {
        self.patches.get(&reference)
    }

    /// Newest first.
    pub fn patches(&self) -> impl Iterator<Item = &PatchReference> {
        self.patches.values()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// A reference number, or a substring of exactly one patch code.
    pub fn select(&self, query: &str) -> Result<&PatchReference> {
        if let Ok(reference) = query.trim().parse::<usize>() {
            if let Some(patch) = self.patches.get(&reference) {
                return Ok(patch);
            }
        }
        let matches: Vec<&PatchReference> = self
            .patches
            .values()
            .filter(|p| !query.is_empty() && p.identity.code.contains(query))
            .collect();
        match matches.as_slice() {
            [only] => Ok(only),
            _ => Err(PatchError::PatchNotUniquelyIdentified {
                query: query.to_string(),
                matches: matches.len(),
            }),
        }
    }

    /// Deployed patches created after `reference` that touch any of its files.
    pub fn conflicts(&self, reference: usize) -> Vec<Conflict> {
        let requested = match self.patches.get(&reference) {
            Some(p) => p,
            None => return Vec::new(),
        };
        self.patches
            .range(..reference)
            .map(|(_, newer)| newer)
            .filter(|newer| newer.is_deployed())
            .filter_map(|newer| {
                let deployed_at = newer.deployed_at.clone().unwrap_or_default();
                let files: Vec<String> = newer.files.intersection(&requested.files).cloned().collect();
                if files.is_empty() {
                    return None;
                }
                Some(Conflict {
                    reference: newer.reference,
                    identity: newer.identity.clone(),
                    deployed_at,
                    files,
                })
            })
            .collect()
    }
}

/// Identity for a new patch: a folder with the same date and code keeps its
/// sequence, otherwise the next free sequence of that date.
pub fn next_identity(patch_root: &Path, date: &str, code: &str) -> Result<PatchIdentity> {
    let same_date: Vec<PatchIdentity> = list_folders(patch_root)?
        .into_iter()
        .map(|(_, identity)| identity)
        .filter(|identity| identity.date == date)
        .collect();

    let sequence = match same_date.iter().find(|identity| identity.code == code) {
        Some(existing) => existing.sequence,
        None => same_date.iter().map(|i| i.sequence).max().unwrap_or(0) + 1,
    };
    Ok(PatchIdentity {
        date: date.to_string(),
        sequence,
        code: code.to_string(),
    })
}

fn list_folders(patch_root: &Path) -> Result<Vec<(String, PatchIdentity)>> {
    let entries = match std::fs::read_dir(patch_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut folders = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        match PatchIdentity::parse(&name) {
            Ok(identity) => folders.push((name, identity)),
            Err(_) => warn!(folder = %name, "not a patch folder, skipped"),
        }
    }
    Ok(folders)
}

fn read_patch(reference: usize, identity: PatchIdentity, folder: &Path) -> Result<PatchReference> {
    let mut scripts = Vec::new();
    let mut files = BTreeSet::new();
    let mut commits = BTreeSet::new();
    let mut logs = Vec::new();

    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".sql") {
            let text = std::fs::read_to_string(entry.path())?;
            commits.extend(parse_commits(&text));
            files.extend(parse_references(&text));
            scripts.push(name);
        } else if let Some(log) = DeploymentLogEntry::parse_file_name(&name) {
            logs.push(log);
        }
    }
    scripts.sort();
    logs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.file_name.cmp(&b.file_name)));

    let (deployed_at, result) = latest_attempt(&logs);
    Ok(PatchReference {
        reference,
        identity,
        folder: folder.to_path_buf(),
        scripts,
        files,
        commits,
        logs,
        deployed_at,
        result,
    })
}

/// Latest timestamp wins; among logs sharing it the alphabetically lesser
/// result (`ERROR` before `SUCCESS`) is reported.
fn latest_attempt(logs: &[DeploymentLogEntry]) -> (Option<String>, Option<DeployResult>) {
    let latest = match logs.iter().map(|l| l.timestamp.as_str()).max() {
        Some(ts) => ts,
        None => return (None, None),
    };
    let result = logs
        .iter()
        .filter(|l| l.timestamp == latest)
        .map(|l| l.result)
        .min_by_key(|r| r.as_str());
    (Some(latest.to_string()), result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, text: &str) {
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, text).expect("write");
    }

    fn script(commits: &[(u64, &str)], files: &[&str]) -> String {
        let mut text = String::from("-- COMMITS:\n");
        for (id, summary) in commits {
            text.push_str(&format!("--   {}) {}\n", id, summary));
        }
        text.push_str("--\n\nSET DEFINE OFF\n");
        for f in files {
            text.push_str(&format!("@\"./{}\"\n", f));
        }
        text.push_str("PROMPT -- SUCCESS\n");
        text
    }

    fn log(folder: &Path, key: &str, ts: &str, result: DeployResult) {
        write(&folder.join(DeploymentLogEntry::file_name_for(key, ts, result)), "output\n");
    }

    /// Three patches, newest last created:
    /// 20261001-01-JIRA-1 (HR: emp), 20261002-01-JIRA-2 (HR: emp, dept), 20261002-02-OPS-9 (SALES: orders)
    fn sample_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        write(
            &root.join("20261001-01-JIRA-1/HR.sql"),
            &script(&[(10, "JIRA-1 add column")], &["database/HR/tables/emp.sql"]),
        );
        write(
            &root.join("20261002-01-JIRA-2/HR.sql"),
            &script(
                &[(14, "JIRA-2 dept"), (13, "JIRA-2 emp")],
                &["database/HR/tables/emp.sql", "database/HR/tables/dept.sql"],
            ),
        );
        write(
            &root.join("20261002-02-OPS-9/SALES.sql"),
            &script(&[(15, "OPS-9 orders")], &["database/SALES/tables/orders.sql"]),
        );
        write(&root.join("20261002-02-OPS-9/database/SALES/tables/orders.sql"), "create table orders;\n");
        write(&root.join("notes/readme.txt"), "not a patch\n");
        dir
    }

    #[test]
    fn test_refs_are_reverse_creation_order() {
        let dir = sample_root();
        let registry = Registry::scan(dir.path()).expect("scan");
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get(1).expect("ref 1").identity.code, "OPS-9");
        assert_eq!(registry.get(2).expect("ref 2").identity.code, "JIRA-2");
        assert_eq!(registry.get(3).expect("ref 3").identity.code, "JIRA-1");
        let order: Vec<usize> = registry.patches().map(|p| p.reference).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_scan_reads_headers_and_references() {
        let dir = sample_root();
        let registry = Registry::scan(dir.path()).expect("scan");
        let jira2 = registry.get(2).expect("ref 2");
        assert_eq!(jira2.commits.iter().copied().collect::<Vec<_>>(), vec![13, 14]);
        assert!(jira2.files.contains("database/HR/tables/dept.sql"));
        assert_eq!(jira2.scripts, vec!["HR.sql"]);
        assert!(!jira2.is_deployed());
        assert!(jira2.result.is_none());
    }

    #[test]
    fn test_rescan_is_idempotent() {
        let dir = sample_root();
        log(&dir.path().join("20261002-01-JIRA-2"), "HR", "2026-10-03 09-00-00", DeployResult::Success);
        let first = Registry::scan(dir.path()).expect("scan");
        let second = Registry::scan(dir.path()).expect("scan");
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let registry = Registry::scan(Path::new("/nonexistent/patches")).expect("scan");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_latest_timestamp_decides_result() {
        let dir = sample_root();
        let folder = dir.path().join("20261002-01-JIRA-2");
        log(&folder, "HR", "2026-10-03 09-00-00", DeployResult::Error);
        log(&folder, "HR", "2026-10-04 10-00-00", DeployResult::Success);
        std::fs::write(folder.join("HR.log"), "raw spool\n").expect("write");

        let registry = Registry::scan(dir.path()).expect("scan");
        let patch = registry.get(2).expect("ref 2");
        assert_eq!(patch.logs.len(), 2);
        assert!(patch.is_deployed());
        assert_eq!(patch.deployed_at.as_deref(), Some("2026-10-04 10-00-00"));
        assert_eq!(patch.result, Some(DeployResult::Success));
    }

    #[test]
    fn test_error_wins_timestamp_tie() {
        // Two schema scripts recorded in the same second: the tie goes to the
        // alphabetically lesser result, which is ERROR.
        let dir = sample_root();
        let folder = dir.path().join("20261002-01-JIRA-2");
        log(&folder, "HR", "2026-10-04 10-00-00", DeployResult::Success);
        log(&folder, "SALES", "2026-10-04 10-00-00", DeployResult::Error);

        let registry = Registry::scan(dir.path()).expect("scan");
        assert_eq!(registry.get(2).expect("ref 2").result, Some(DeployResult::Error));
    }

    #[test]
    fn test_select_by_ref_and_code() {
        let dir = sample_root();
        let registry = Registry::scan(dir.path()).expect("scan");
        assert_eq!(registry.select("3").expect("ref").identity.code, "JIRA-1");
        assert_eq!(registry.select("OPS").expect("code").reference, 1);

        match registry.select("JIRA") {
            Err(PatchError::PatchNotUniquelyIdentified { matches, .. }) => assert_eq!(matches, 2),
            other => panic!("expected ambiguity, got {:?}", other.map(|p| p.reference)),
        }
        match registry.select("NOPE") {
            Err(PatchError::PatchNotUniquelyIdentified { matches, .. }) => assert_eq!(matches, 0),
            other => panic!("expected no match, got {:?}", other.map(|p| p.reference)),
        }
    }

    #[test]
    fn test_conflicts_only_from_newer_deployed_patches() {
        let dir = sample_root();
        let registry = Registry::scan(dir.path()).expect("scan");
        assert!(registry.conflicts(3).is_empty(), "nothing deployed yet");

        log(&dir.path().join("20261002-01-JIRA-2"), "HR", "2026-10-03 09-00-00", DeployResult::Success);
        log(&dir.path().join("20261002-02-OPS-9"), "SALES", "2026-10-03 09-05-00", DeployResult::Success);
        let registry = Registry::scan(dir.path()).expect("scan");

        let conflicts = registry.conflicts(3);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].reference, 2);
        assert_eq!(conflicts[0].files, vec!["database/HR/tables/emp.sql"]);

        // Older patches never block newer ones.
        assert!(registry.conflicts(2).is_empty());
    }

    #[test]
    fn test_next_identity_reuses_or_increments() {
        let dir = sample_root();
        let same = next_identity(dir.path(), "20261002", "JIRA-2").expect("identity");
        assert_eq!(same.sequence, 1);
        let new = next_identity(dir.path(), "20261002", "JIRA-5").expect("identity");
        assert_eq!(new.sequence, 3);
        assert_eq!(new.folder_name(), "20261002-03-JIRA-5");
        let fresh = next_identity(dir.path(), "20261005", "JIRA-5").expect("identity");
        assert_eq!(fresh.sequence, 1);
    }

    #[test]
    fn test_reference_serializes_with_ref_key() {
        let dir = sample_root();
        let registry = Registry::scan(dir.path()).expect("scan");
        let json = serde_json::to_value(registry.get(1).expect("ref 1")).expect("serialize");
        assert_eq!(json["ref"], 1);
        assert_eq!(json["identity"]["code"], "OPS-9");
    }
}
