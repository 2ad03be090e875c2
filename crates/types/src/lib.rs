use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub mod config;

pub use config::{
    AppPolicy, ApplicationConfig, Config, DeployConfig, GroupConfig, ObjectTypeConfig,
    PathsConfig, RepositoryConfig, ScriptConfig,
};

// ── Error ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("no commits found for the given filters")]
    NoCommitsFound,
    #[error("patch not uniquely identified by '{query}' ({matches} matching folders)")]
    PatchNotUniquelyIdentified { query: String, matches: usize },
    #[error("unresolved template tag {{${tag}}} in {source_name}")]
    UnresolvedTag { tag: String, source_name: String },
    #[error("not all files processed, unknown object types: {}", .files.join(", "))]
    NotAllFilesProcessed { files: Vec<String> },
    #[error("missing file: {}", .0.display())]
    MissingFile(PathBuf),
    #[error("invalid patch folder name: {0}")]
    InvalidPatchName(String),
    #[error("execution error: {0}")]
    Execution(String),
    #[cfg(feature = "git2-errors")]
    #[error("git error: {0}")]
    Git(#[from] git2::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
}

impl PatchError {
    /// Errors the user fixes by changing arguments rather than the setup.
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            PatchError::NoCommitsFound
                | PatchError::PatchNotUniquelyIdentified { .. }
                | PatchError::UnresolvedTag { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PatchError>;

// ── History types ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    /// 1-based position in the oldest-first walk of the branch. 0 is the empty baseline.
    pub sequence_id: u64,
    pub hash: String,
    pub author: String,
    pub timestamp: i64,
    pub summary: String,
    pub changed_files: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
    Copied,
    Unknown,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Added => "A",
            FileStatus::Modified => "M",
            FileStatus::Deleted => "D",
            FileStatus::Renamed => "R",
            FileStatus::Copied => "C",
            FileStatus::Unknown => "?",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub status: FileStatus,
}

/// Commits selected for a patch, with the boundaries of the net diff.
#[derive(Debug, Clone)]
pub struct CommitRange {
    /// Newest first.
    pub relevant: Vec<Commit>,
    /// Exclusive lower boundary: the last commit before the earliest relevant one.
    pub first_commit: u64,
    pub last_commit: u64,
}

/// Net change between the two boundary commits of a range.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    /// Relevant commits that touched at least one candidate file, newest first.
    pub commits: Vec<Commit>,
    /// Hash of `last_commit`; snapshots are taken from this tree.
    pub last_hash: String,
}

impl ChangeSet {
    /// Files that still exist at the end of the range, sorted.
    pub fn present_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self
            .added
            .iter()
            .chain(self.modified.iter())
            .cloned()
            .collect();
        files.sort();
        files.dedup();
        files
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

// ── Object types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum ObjectType {
    #[serde(rename = "TABLE")]
    Table,
    #[serde(rename = "INDEX")]
    Index,
    #[serde(rename = "SEQUENCE")]
    Sequence,
    #[serde(rename = "TYPE")]
    Type,
    #[serde(rename = "TYPE BODY")]
    TypeBody,
    #[serde(rename = "PACKAGE")]
    Package,
    #[serde(rename = "PACKAGE BODY")]
    PackageBody,
    #[serde(rename = "PROCEDURE")]
    Procedure,
    #[serde(rename = "FUNCTION")]
    Function,
    #[serde(rename = "TRIGGER")]
    Trigger,
    #[serde(rename = "VIEW")]
    View,
    #[serde(rename = "MATERIALIZED VIEW")]
    MaterializedView,
    #[serde(rename = "SYNONYM")]
    Synonym,
    #[serde(rename = "JOB")]
    Job,
    #[serde(rename = "MVIEW LOG")]
    MviewLog,
    #[serde(rename = "DATA")]
    Data,
    #[serde(rename = "GRANT")]
    Grant,
}

impl ObjectType {
    pub const ALL: [ObjectType; 17] = [
        ObjectType::Table,
        ObjectType::Index,
        ObjectType::Sequence,
        ObjectType::Type,
        ObjectType::TypeBody,
        ObjectType::Package,
        ObjectType::PackageBody,
        ObjectType::Procedure,
        ObjectType::Function,
        ObjectType::Trigger,
        ObjectType::View,
        ObjectType::MaterializedView,
        ObjectType::Synonym,
        ObjectType::Job,
        ObjectType::MviewLog,
        ObjectType::Data,
        ObjectType::Grant,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Table => "TABLE",
            ObjectType::Index => "INDEX",
            ObjectType::Sequence => "SEQUENCE",
            ObjectType::Type => "TYPE",
            ObjectType::TypeBody => "TYPE BODY",
            ObjectType::Package => "PACKAGE",
            ObjectType::PackageBody => "PACKAGE BODY",
            ObjectType::Procedure => "PROCEDURE",
            ObjectType::Function => "FUNCTION",
            ObjectType::Trigger => "TRIGGER",
            ObjectType::View => "VIEW",
            ObjectType::MaterializedView => "MATERIALIZED VIEW",
            ObjectType::Synonym => "SYNONYM",
            ObjectType::Job => "JOB",
            ObjectType::MviewLog => "MVIEW LOG",
            ObjectType::Data => "DATA",
            ObjectType::Grant => "GRANT",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_uppercase();
        ObjectType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| PatchError::Config(format!("unknown object type '{}'", s)))
    }
}

/// What a repository path means, derived from path conventions only.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectDescriptor {
    pub path: String,
    pub is_database_object: bool,
    pub is_application_export: bool,
    pub schema_folder: String,
    /// `None` when no convention matched.
    pub object_type: Option<ObjectType>,
    pub object_name: String,
    pub application_id: Option<u32>,
    pub page_id: Option<u32>,
}

impl ObjectDescriptor {
    pub fn is_classified(&self) -> bool {
        self.object_type.is_some() || self.application_id.is_some()
    }

    pub fn schema_key(&self) -> Option<SchemaKey> {
        if self.schema_folder.is_empty() {
            return None;
        }
        Some(SchemaKey {
            schema: self.schema_folder.clone(),
            application_id: if self.is_application_export {
                self.application_id
            } else {
                None
            },
        })
    }
}

// ── Patch identity ────────────────────────────────────────────────────────

/// Target of one generated script: a schema, or `SCHEMA.APPID` for an application.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaKey {
    pub schema: String,
    pub application_id: Option<u32>,
}

impl SchemaKey {
    pub fn schema(schema: &str) -> Self {
        SchemaKey {
            schema: schema.to_string(),
            application_id: None,
        }
    }
}

impl fmt::Display for SchemaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.application_id {
            Some(app_id) => write!(f, "{}.{}", self.schema, app_id),
            None => write!(f, "{}", self.schema),
        }
    }
}

impl FromStr for SchemaKey {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || s.contains(char::is_whitespace) {
            return Err(PatchError::Config(format!("invalid schema key '{}'", s)));
        }
        match s.rsplit_once('.') {
            Some((schema, app)) if !schema.is_empty() && app.chars().all(|c| c.is_ascii_digit()) && !app.is_empty() => {
                let application_id = app
                    .parse::<u32>()
                    .map_err(|e| PatchError::Config(format!("invalid schema key '{}': {}", s, e)))?;
                Ok(SchemaKey {
                    schema: schema.to_string(),
                    application_id: Some(application_id),
                })
            }
            _ => Ok(SchemaKey::schema(s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct PatchIdentity {
    /// `YYYYMMDD`
    pub date: String,
    pub sequence: u32,
    pub code: String,
}

impl PatchIdentity {
    pub fn folder_name(&self) -> String {
        format!("{}-{:02}-{}", self.date, self.sequence, self.code)
    }

    /// Parses `<date>-<sequence>-<code>`; the code keeps any further hyphens.
    pub fn parse(folder_name: &str) -> Result<Self> {
        let invalid = || PatchError::InvalidPatchName(folder_name.to_string());
        let mut parts = folder_name.splitn(3, '-');
        let date = parts.next().ok_or_else(invalid)?;
        let sequence = parts.next().ok_or_else(invalid)?;
        let code = parts.next().ok_or_else(invalid)?;
        if date.is_empty() || !date.chars().all(|c| c.is_ascii_digit()) || code.is_empty() {
            return Err(invalid());
        }
        let sequence = sequence.parse::<u32>().map_err(|_| invalid())?;
        Ok(PatchIdentity {
            date: date.to_string(),
            sequence,
            code: code.to_string(),
        })
    }
}

impl fmt::Display for PatchIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.folder_name())
    }
}

// ── Deployment log ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeployResult {
    Success,
    Error,
}

impl DeployResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployResult::Success => "SUCCESS",
            DeployResult::Error => "ERROR",
        }
    }
}

impl fmt::Display for DeployResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DeployResult {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SUCCESS" => Ok(DeployResult::Success),
            "ERROR" => Ok(DeployResult::Error),
            other => Err(PatchError::Config(format!("unknown deploy result '{}'", other))),
        }
    }
}

/// One executed script, recovered from its log file name
/// `<schema_key> <date> <time> [<RESULT>].log`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeploymentLogEntry {
    pub schema_key: String,
    /// `YYYY-MM-DD HH-MM-SS`, sorts chronologically as text.
    pub timestamp: String,
    pub result: DeployResult,
    pub file_name: String,
}

impl DeploymentLogEntry {
    pub fn file_name_for(schema_key: &str, timestamp: &str, result: DeployResult) -> String {
        format!("{} {} [{}].log", schema_key, timestamp, result)
    }

    /// Returns `None` for names that are not result logs (e.g. a raw spool file).
    pub fn parse_file_name(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(".log")?;
        let (head, tail) = stem.rsplit_once(" [")?;
        let result = tail.strip_suffix(']')?.parse::<DeployResult>().ok()?;
        let (schema_key, timestamp) = head.split_once(' ')?;
        if schema_key.is_empty() || timestamp.trim().is_empty() {
            return None;
        }
        Some(DeploymentLogEntry {
            schema_key: schema_key.to_string(),
            timestamp: timestamp.trim().to_string(),
            result,
            file_name: file_name.to_string(),
        })
    }
}

// ── Core traits ───────────────────────────────────────────────────────────

/// Read access to version-control history.
pub trait History {
    /// Up to `max_count` commits of `branch`, newest first. `None` means HEAD.
    fn commits(&self, branch: Option<&str>, max_count: usize) -> Result<Vec<Commit>>;
    /// Hash of the commit with this sequence id; `None` for the empty baseline (0).
    fn hash_at(&self, branch: Option<&str>, sequence_id: u64) -> Result<Option<String>>;
    /// Tree diff between two commits; `from = None` diffs from the empty tree.
    fn diff(&self, from: Option<&str>, to: &str) -> Result<Vec<FileChange>>;
    /// Blob content at `commit`, `None` if the path does not exist there.
    fn file_contents(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>>;
}

/// Captured result of running one script.
#[derive(Debug, Clone, Default)]
pub struct Execution {
    pub output: String,
    pub exit_code: Option<i32>,
}

/// Submits script text to a target schema and captures its output.
pub trait ScriptExecutor {
    fn execute(&self, target: &str, script: &str, working_dir: &Path) -> Result<Execution>;
}

// ── Tests ─────────────────────────────────────────────────────────────────
