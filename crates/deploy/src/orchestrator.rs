use std::path::Path;

use schemapatch_registry::{Conflict, PatchReference, Registry};
use schemapatch_types::{
    Config, DeployResult, DeploymentLogEntry, Result, SchemaKey, ScriptExecutor,
};
use serde::Serialize;
use tracing::{debug, info, warn};

/// `chrono` format of the timestamp embedded in result log names.
pub const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H-%M-%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum BlockReason {
    /// The patch's own latest attempt succeeded.
    AlreadyDeployed { deployed_at: String },
    /// Newer deployed patches share files with this one.
    Conflicts {
        conflicted_files: Vec<String>,
        with: Vec<Conflict>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptResult {
    pub schema_key: String,
    pub result: DeployResult,
    pub log_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeployOutcome {
    Deployed {
        results: Vec<ScriptResult>,
        /// The patch as re-read after recording.
        patch: PatchReference,
    },
    Blocked {
        reference: usize,
        reason: BlockReason,
    },
}

pub struct Deployer<'a> {
    config: &'a Config,
    executor: &'a dyn ScriptExecutor,
}

impl<'a> Deployer<'a> {
    pub fn new(config: &'a Config, executor: &'a dyn ScriptExecutor) -> Self {
        Deployer { config, executor }
    }

    /// Selects, checks and executes a patch, stamping logs with the local time.
    pub fn deploy(&self, registry: &Registry, query: &str, force: bool) -> Result<DeployOutcome> {
        let now = chrono::Local::now().format(LOG_TIMESTAMP_FORMAT).to_string();
        self.deploy_at(registry, query, force, &now)
    }

    pub fn deploy_at(
        &self,
        registry: &Registry,
        query: &str,
        force: bool,
        timestamp: &str,
    ) -> Result<DeployOutcome> {
        let patch = registry.select(query)?;

        if !force {
            if let Some(reason) = block_reason(registry, patch) {
                info!(
                    reference = patch.reference,
                    folder = %patch.identity.folder_name(),
                    ?reason,
                    "deployment blocked"
                );
                return Ok(DeployOutcome::Blocked {
                    reference: patch.reference,
                    reason,
                });
            }
        }

        let mut results = Vec::new();
        for script in &patch.scripts {
            let key = match script.strip_suffix(".sql") {
                Some(key) => key,
                None => continue,
            };
            let result = self.run_script(&patch.folder, key, timestamp)?;
            results.push(result);
        }
        info!(
            reference = patch.reference,
            folder = %patch.identity.folder_name(),
            succeeded = results.iter().filter(|r| r.result == DeployResult::Success).count(),
            failed = results.iter().filter(|r| r.result == DeployResult::Error).count(),
            "deployment recorded"
        );

        let rescanned = Registry::scan(registry.root())?;
        let patch = rescanned
            .patches()
            .find(|p| p.folder == patch.folder)
            .cloned()
            .unwrap_or_else(|| patch.clone());
        Ok(DeployOutcome::Deployed { results, patch })
    }

    fn run_script(&self, folder: &Path, key: &str, timestamp: &str) -> Result<ScriptResult> {
        let raw_log = folder.join(format!("{}.log", key));
        if raw_log.exists() {
            std::fs::remove_file(&raw_log)?;
        }

        let output = match self.connection(key) {
            Some(target) => {
                let script = std::fs::read_to_string(folder.join(format!("{}.sql", key)))?;
                match self.executor.execute(target, &strip_comments(&script), folder) {
                    Ok(run) => {
                        debug!(schema_key = key, exit_code = ?run.exit_code, "script executed");
                        run.output
                    }
                    Err(e) => {
                        warn!(schema_key = key, error = %e, "script could not be executed");
                        format!("{}\n", e)
                    }
                }
            }
            None => {
                warn!(schema_key = key, "no connection configured");
                format!("no connection configured for schema key {}\n", key)
            }
        };

        let result = if has_marker(&output, &self.config.script.marker, self.config.deploy.tail_lines) {
            DeployResult::Success
        } else {
            DeployResult::Error
        };

        // A spooling script leaves its own log; otherwise keep the captured output.
        if !raw_log.exists() {
            std::fs::write(&raw_log, &output)?;
        }
        let log_file = DeploymentLogEntry::file_name_for(key, timestamp, result);
        std::fs::rename(&raw_log, folder.join(&log_file))?;

        if result == DeployResult::Error {
            warn!(schema_key = key, log = %log_file, "script failed");
        }
        Ok(ScriptResult {
            schema_key: key.to_string(),
            result,
            log_file,
        })
    }

    fn connection(&self, key: &str) -> Option<&str> {
        let key: SchemaKey = key.parse().ok()?;
        self.config.connection_for(&key)
    }
}

fn block_reason(registry: &Registry, patch: &PatchReference) -> Option<BlockReason> {
    if patch.result == Some(DeployResult::Success) {
        return Some(BlockReason::AlreadyDeployed {
            deployed_at: patch.deployed_at.clone().unwrap_or_default(),
        });
    }
    let with = registry.conflicts(patch.reference);
    if with.is_empty() {
        return None;
    }
    let mut conflicted_files: Vec<String> = with.iter().flat_map(|c| c.files.iter().cloned()).collect();
    conflicted_files.sort();
    conflicted_files.dedup();
    Some(BlockReason::Conflicts {
        conflicted_files,
        with,
    })
}

/// Drops blank lines and lines that hold only a `--` comment.
pub fn strip_comments(script: &str) -> String {
    script
        .lines()
        .filter(|l| {
            let l = l.trim();
            !l.is_empty() && !l.starts_with("--")
        })
        .map(|l| format!("{}\n", l.trim_end()))
        .collect()
}

/// Whether `marker` appears as a line among the last `tail_lines` non-empty output lines.
pub fn has_marker(output: &str, marker: &str, tail_lines: usize) -> bool {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .rev()
        .take(tail_lines)
        .any(|l| l == marker.trim())
}
