//! Typed configuration (`schemapatch.toml`).
//!
//! Every recognised key is a field here. Missing keys take defaults, unknown
//! keys are rejected, and [`Config::validate`] checks cross-references once at
//! load time so later stages can index the tables without re-checking.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{ObjectType, PatchError, Result, SchemaKey};

/// File name looked up at the repository root.
pub const CONFIG_FILE_NAME: &str = "schemapatch.toml";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default = "default_object_types")]
    pub object_types: Vec<ObjectTypeConfig>,
    #[serde(default = "default_groups")]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub script: ScriptConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    /// Schema key (`HR` or `APPS.100`) to connect string.
    #[serde(default)]
    pub connections: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repository: RepositoryConfig::default(),
            paths: PathsConfig::default(),
            object_types: default_object_types(),
            groups: default_groups(),
            application: ApplicationConfig::default(),
            script: ScriptConfig::default(),
            deploy: DeployConfig::default(),
            connections: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositoryConfig {
    /// Branch to mine; HEAD when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default = "default_depth")]
    pub depth: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            branch: None,
            depth: default_depth(),
        }
    }
}

const fn default_depth() -> usize {
    500
}

/// Roots relative to the repository root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    #[serde(default = "default_object_root")]
    pub object_root: String,
    #[serde(default = "default_app_root")]
    pub app_root: String,
    #[serde(default = "default_patch_root")]
    pub patch_root: String,
    #[serde(default = "default_template_root")]
    pub template_root: String,
    #[serde(default = "default_scripts_root")]
    pub scripts_root: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            object_root: default_object_root(),
            app_root: default_app_root(),
            patch_root: default_patch_root(),
            template_root: default_template_root(),
            scripts_root: default_scripts_root(),
        }
    }
}

fn default_object_root() -> String {
    "database/".to_owned()
}

fn default_app_root() -> String {
    "apex/".to_owned()
}

fn default_patch_root() -> String {
    "patches/".to_owned()
}

fn default_template_root() -> String {
    "patch_template/".to_owned()
}

fn default_scripts_root() -> String {
    "patch_scripts/".to_owned()
}

impl PathsConfig {
    pub fn object_prefix(&self) -> String {
        as_prefix(&self.object_root)
    }

    pub fn app_prefix(&self) -> String {
        as_prefix(&self.app_root)
    }
}

/// Normalises a root to `a/b/` form so prefix tests never match `a/bc`.
pub fn as_prefix(root: &str) -> String {
    let trimmed = root.trim_start_matches("./").trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

/// Where files of one object type live: `<object_root>/<SCHEMA>/<folder>/<name><ext>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectTypeConfig {
    #[serde(rename = "type")]
    pub object_type: ObjectType,
    pub folder: String,
    pub extensions: Vec<String>,
}

/// One step of the emission order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    pub name: String,
    /// Emission order inside the group.
    pub types: Vec<ObjectType>,
}

fn object_type(object_type: ObjectType, folder: &str, extensions: &[&str]) -> ObjectTypeConfig {
    ObjectTypeConfig {
        object_type,
        folder: folder.to_owned(),
        extensions: extensions.iter().map(|e| (*e).to_owned()).collect(),
    }
}

fn default_object_types() -> Vec<ObjectTypeConfig> {
    use ObjectType::*;
    vec![
        object_type(Sequence, "sequences", &[".sql"]),
        object_type(Type, "types", &[".sql", ".spec.sql"]),
        object_type(TypeBody, "types", &[".body.sql"]),
        object_type(Table, "tables", &[".sql"]),
        object_type(Index, "indexes", &[".sql"]),
        object_type(MviewLog, "mview_logs", &[".sql"]),
        object_type(Synonym, "synonyms", &[".sql"]),
        object_type(View, "views", &[".sql"]),
        object_type(MaterializedView, "mviews", &[".sql"]),
        object_type(Package, "packages", &[".pks", ".spec.sql"]),
        object_type(PackageBody, "packages", &[".pkb", ".sql"]),
        object_type(Procedure, "procedures", &[".sql"]),
        object_type(Function, "functions", &[".sql"]),
        object_type(Trigger, "triggers", &[".sql"]),
        object_type(Job, "jobs", &[".sql"]),
        object_type(Data, "data", &[".sql"]),
        object_type(Grant, "grants", &[".sql"]),
    ]
}

fn group(name: &str, types: &[ObjectType]) -> GroupConfig {
    GroupConfig {
        name: name.to_owned(),
        types: types.to_vec(),
    }
}

fn default_groups() -> Vec<GroupConfig> {
    use ObjectType::*;
    vec![
        group("sequences", &[Sequence, Type]),
        group("tables", &[Table]),
        group("indexes", &[Index, MviewLog]),
        group("synonyms", &[Synonym]),
        group("views", &[View, MaterializedView]),
        group("specs", &[Package, Procedure, Function]),
        group("bodies", &[TypeBody, PackageBody]),
        group("triggers", &[Trigger]),
        group("jobs", &[Job]),
        group("data", &[Data]),
        group("grants", &[Grant]),
    ]
}

/// How changed application exports are replayed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AppPolicy {
    /// Replay only the changed component files.
    #[default]
    Split,
    /// Reinstall the full application export.
    Full,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplicationConfig {
    /// Parsing schema for applications without an override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default)]
    pub policy: AppPolicy,
    /// Application id to parsing schema.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, String>,
}

impl ApplicationConfig {
    pub fn schema_for(&self, application_id: u32) -> Option<&str> {
        self.overrides
            .get(&application_id.to_string())
            .or(self.schema.as_ref())
            .map(String::as_str)
    }
}

/// Lines wrapped around every generated script.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptConfig {
    #[serde(default = "default_prologue")]
    pub prologue: Vec<String>,
    #[serde(default = "default_epilogue")]
    pub epilogue: Vec<String>,
    /// Literal looked for in the tail of the captured output.
    #[serde(default = "default_marker")]
    pub marker: String,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            prologue: default_prologue(),
            epilogue: default_epilogue(),
            marker: default_marker(),
        }
    }
}

fn default_prologue() -> Vec<String> {
    [
        "SET DEFINE OFF",
        "SET TIMING OFF",
        "SET SQLBLANKLINES ON",
        "WHENEVER OSERROR EXIT ROLLBACK",
        "WHENEVER SQLERROR EXIT ROLLBACK",
        "SPOOL \"{$LOG_FILE}\" APPEND",
        "PROMPT -- PATCH {$PATCH_CODE} ON {$SCHEMA_KEY}",
    ]
    .iter()
    .map(|l| (*l).to_owned())
    .collect()
}

fn default_epilogue() -> Vec<String> {
    ["COMMIT;", "PROMPT {$MARKER}", "SPOOL OFF"]
        .iter()
        .map(|l| (*l).to_owned())
        .collect()
}

fn default_marker() -> String {
    "-- SUCCESS".to_owned()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeployConfig {
    /// SQL shell binary.
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments placed before the connect string.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// How many trailing output lines are searched for the marker.
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            timeout_seconds: default_timeout_seconds(),
            tail_lines: default_tail_lines(),
        }
    }
}

fn default_program() -> String {
    "sql".to_owned()
}

fn default_args() -> Vec<String> {
    vec!["-S".to_owned(), "-L".to_owned()]
}

const fn default_timeout_seconds() -> u64 {
    3600
}

const fn default_tail_lines() -> usize {
    10
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Loads and validates `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(PatchError::Config(format!(
                    "{}: could not read file: {}",
                    path.display(),
                    e
                )))
            }
        };
        Self::parse(&contents).map_err(|e| match e {
            PatchError::Config(msg) => PatchError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    pub fn parse(toml_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start].chars().filter(|&c| c == '\n').count() + 1;
                message = format!("line {}: {}", line, message);
            }
            PatchError::Config(message)
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PatchError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let known: HashSet<ObjectType> = self.object_types.iter().map(|t| t.object_type).collect();
        for t in &self.object_types {
            if t.folder.trim().is_empty() || t.folder.contains('/') {
                return Err(PatchError::Config(format!(
                    "object type {} needs a single folder name, got '{}'",
                    t.object_type, t.folder
                )));
            }
            if t.extensions.is_empty() || t.extensions.iter().any(|e| !e.starts_with('.')) {
                return Err(PatchError::Config(format!(
                    "object type {} needs extensions starting with '.'",
                    t.object_type
                )));
            }
        }

        let mut names = HashSet::new();
        let mut grouped = HashSet::new();
        for g in &self.groups {
            if g.name.is_empty() || !names.insert(g.name.as_str()) {
                return Err(PatchError::Config(format!("duplicate or empty group name '{}'", g.name)));
            }
            for t in &g.types {
                if !known.contains(t) {
                    return Err(PatchError::Config(format!(
                        "group '{}' lists {} which has no [[object_types]] entry",
                        g.name, t
                    )));
                }
                if !grouped.insert(*t) {
                    return Err(PatchError::Config(format!("{} appears in more than one group", t)));
                }
            }
        }

        if self.script.marker.trim().is_empty() {
            return Err(PatchError::Config("script.marker must not be empty".into()));
        }
        if self.deploy.tail_lines == 0 {
            return Err(PatchError::Config("deploy.tail_lines must be at least 1".into()));
        }
        for key in self.connections.keys() {
            key.parse::<SchemaKey>()?;
        }
        for id in self.application.overrides.keys() {
            id.parse::<u32>().map_err(|_| {
                PatchError::Config(format!("application.overrides key '{}' is not an application id", id))
            })?;
        }
        Ok(())
    }

    /// Connect string for a script target; falls back from `SCHEMA.APPID` to `SCHEMA`.
    pub fn connection_for(&self, key: &SchemaKey) -> Option<&str> {
        self.connections
            .get(&key.to_string())
            .or_else(|| self.connections.get(&key.schema))
            .map(String::as_str)
    }
}
