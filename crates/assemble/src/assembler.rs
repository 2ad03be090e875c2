use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use schemapatch_types::config::as_prefix;
use schemapatch_types::{
    ChangeSet, Commit, CommitRange, Config, History, ObjectDescriptor, PatchError, PatchIdentity,
    Result, SchemaKey,
};
use tracing::{debug, info, warn};

use crate::apex;
use crate::classify::classify;
use crate::template::{render, Fragments, TemplateContext};

/// A patch rendered in memory, ready to be written to its folder.
#[derive(Debug, Clone)]
pub struct Patch {
    pub identity: PatchIdentity,
    /// `(first_commit, last_commit)`; the first is exclusive.
    pub commit_range: (u64, u64),
    pub relevant_files: BTreeMap<SchemaKey, Vec<String>>,
    pub scripts: BTreeMap<SchemaKey, String>,
    /// Repository-relative path to the bytes copied into the patch folder.
    pub snapshots: BTreeMap<String, Vec<u8>>,
}

/// Everything one script needs besides its own files.
pub struct ScriptInput<'b> {
    pub identity: &'b PatchIdentity,
    /// Header provenance, newest first.
    pub commits: Vec<&'b Commit>,
    /// Deleted files of this schema key, listed but not executed.
    pub removed: Vec<&'b str>,
    /// Commit the snapshots are read from.
    pub last_hash: &'b str,
}

/// Text of one script plus the files it references.
#[derive(Debug, Default)]
pub struct ScriptOutput {
    pub text: String,
    pub snapshots: BTreeMap<String, Vec<u8>>,
}

#[derive(Default)]
pub(crate) struct ScriptBuilder {
    text: String,
    snapshots: BTreeMap<String, Vec<u8>>,
}

impl ScriptBuilder {
    pub(crate) fn line(&mut self, line: &str) {
        self.text.push_str(line);
        self.text.push('\n');
    }

    pub(crate) fn block(&mut self, block: &str) {
        self.text.push_str(block);
        if !block.ends_with('\n') {
            self.text.push('\n');
        }
    }

    pub(crate) fn reference(&mut self, path: &str, content: Vec<u8>) {
        self.line(&format!("@\"./{}\"", path));
        self.snapshots.insert(path.to_string(), content);
    }

    fn header(&mut self, commits: &[&Commit], removed: &[&str]) {
        self.line("-- COMMITS:");
        for c in commits {
            self.line(&format!("--   {}) {}", c.sequence_id, c.summary));
        }
        self.line("--");
        if !removed.is_empty() {
            self.line("-- REMOVED:");
            for path in removed {
                self.line(&format!("--   {}", path));
            }
            self.line("--");
        }
    }

    fn banner(&mut self, title: &str) {
        self.line("");
        self.line("--");
        self.line(&format!("-- {}", title.to_uppercase()));
        self.line("--");
    }

    fn finish(self) -> ScriptOutput {
        ScriptOutput {
            text: self.text,
            snapshots: self.snapshots,
        }
    }
}

pub struct Assembler<'a> {
    config: &'a Config,
    history: &'a dyn History,
    work_tree: PathBuf,
    fragments: Fragments,
}

impl<'a> Assembler<'a> {
    /// `work_tree` is where template fragments and ad-hoc scripts are read from.
    pub fn new(config: &'a Config, history: &'a dyn History, work_tree: &Path) -> Self {
        let fragments = Fragments::new(&work_tree.join(&config.paths.template_root));
        Assembler {
            config,
            history,
            work_tree: work_tree.to_path_buf(),
            fragments,
        }
    }

    pub(crate) fn config(&self) -> &Config {
        self.config
    }

    pub(crate) fn fragments(&self) -> &Fragments {
        &self.fragments
    }

    /// Renders every script of the patch. Nothing is written here.
    pub fn build(
        &self,
        identity: &PatchIdentity,
        range: &CommitRange,
        changes: &ChangeSet,
    ) -> Result<Patch> {
        let object_prefix = self.config.paths.object_prefix();
        let app_prefix = self.config.paths.app_prefix();

        let mut by_key: BTreeMap<SchemaKey, Vec<ObjectDescriptor>> = BTreeMap::new();
        let mut unkeyed = Vec::new();

        if changes.is_empty() {
            warn!(code = %identity.code, "no object files changed, only ad-hoc scripts are assembled");
        }

        for path in changes.present_files() {
            let descriptor = classify(&path, self.config);
            check_schema_folder(&descriptor)?;
            match descriptor.schema_key() {
                Some(_) if descriptor.is_database_object && !descriptor.is_classified() => {
                    unkeyed.push(path);
                }
                Some(key) if descriptor.is_database_object || descriptor.is_application_export => {
                    by_key.entry(key).or_default().push(descriptor);
                }
                _ if descriptor.is_application_export => {
                    return Err(PatchError::Config(format!(
                        "application {} has no parsing schema, set [application] schema or an override",
                        descriptor.application_id.unwrap_or_default()
                    )));
                }
                _ if path.starts_with(&object_prefix) => unkeyed.push(path),
                _ if path.starts_with(&app_prefix) => {
                    warn!(path = %path, "application file outside any f<id> folder, skipped");
                }
                _ => debug!(path = %path, "not an object file"),
            }
        }
        if !unkeyed.is_empty() {
            return Err(PatchError::NotAllFilesProcessed { files: unkeyed });
        }

        for key in self.adhoc_schema_keys(&identity.code)? {
            by_key.entry(key).or_default();
        }

        let mut removed: BTreeMap<SchemaKey, Vec<&str>> = BTreeMap::new();
        for path in &changes.deleted {
            let descriptor = classify(path, self.config);
            check_schema_folder(&descriptor)?;
            if let Some(key) = descriptor.schema_key() {
                removed.entry(key).or_default().push(path.as_str());
            }
        }
        // Deletion-only schemas still get a script carrying the REMOVED block.
        for key in removed.keys() {
            by_key.entry(key.clone()).or_default();
        }

        let mut patch = Patch {
            identity: identity.clone(),
            commit_range: (range.first_commit, range.last_commit),
            relevant_files: BTreeMap::new(),
            scripts: BTreeMap::new(),
            snapshots: BTreeMap::new(),
        };

        for (key, files) in &by_key {
            let mut paths: BTreeSet<&str> = files.iter().map(|d| d.path.as_str()).collect();
            paths.extend(removed.get(key).into_iter().flatten().copied());
            let mut commits: Vec<&Commit> = changes
                .commits
                .iter()
                .filter(|c| c.changed_files.iter().any(|p| paths.contains(p.as_str())))
                .collect();
            if commits.is_empty() {
                commits = changes.commits.iter().collect();
            }

            let input = ScriptInput {
                identity,
                commits,
                removed: removed.get(key).cloned().unwrap_or_default(),
                last_hash: &changes.last_hash,
            };
            let output = self.assemble(key, files, &input)?;
            info!(
                schema_key = %key,
                files = files.len(),
                snapshots = output.snapshots.len(),
                "assembled script"
            );

            patch.snapshots.extend(output.snapshots);
            patch.scripts.insert(key.clone(), output.text);
            patch
                .relevant_files
                .insert(key.clone(), files.iter().map(|d| d.path.clone()).collect());
        }

        Ok(patch)
    }

    /// One script for one schema key, in group order.
    pub fn assemble(
        &self,
        key: &SchemaKey,
        files: &[ObjectDescriptor],
        input: &ScriptInput<'_>,
    ) -> Result<ScriptOutput> {
        let ctx = self.context(key, input.identity);

        let mut builder = ScriptBuilder::default();
        builder.header(&input.commits, &input.removed);
        builder.line("");
        for line in &self.config.script.prologue {
            builder.line(&render(line, &ctx, "script.prologue")?);
        }

        if key.application_id.is_some() {
            apex::emit_application(self, &mut builder, key, files, &ctx, input.last_hash)?;
        } else {
            self.emit_groups(&mut builder, key, files, &ctx, input)?;
        }

        builder.line("");
        for line in &self.config.script.epilogue {
            builder.line(&render(line, &ctx, "script.epilogue")?);
        }
        Ok(builder.finish())
    }

    fn emit_groups(
        &self,
        builder: &mut ScriptBuilder,
        key: &SchemaKey,
        files: &[ObjectDescriptor],
        ctx: &TemplateContext,
        input: &ScriptInput<'_>,
    ) -> Result<()> {
        let mut remaining: BTreeSet<&str> = files.iter().map(|d| d.path.as_str()).collect();

        for group in &self.config.groups {
            let mut members: Vec<(usize, &ObjectDescriptor)> = files
                .iter()
                .filter_map(|d| {
                    let pos = group.types.iter().position(|t| Some(*t) == d.object_type)?;
                    Some((pos, d))
                })
                .collect();
            members.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.path.cmp(&b.1.path)));

            let before = self.adhoc_scripts(&input.identity.code, key, "before", &group.name)?;
            let after = self.adhoc_scripts(&input.identity.code, key, "after", &group.name)?;
            if members.is_empty() && before.is_empty() && after.is_empty() {
                continue;
            }
            debug!(group = %group.name, files = members.len(), "emitting group");

            let mut group_ctx = ctx.clone();
            group_ctx.group = Some(group.name.clone());

            builder.banner(&group.name);
            if !members.is_empty() {
                if let Some(fragment) = self.fragments.group_before(&group.name, &group_ctx)? {
                    builder.block(&fragment);
                }
            }
            for path in &before {
                builder.reference(path, self.read_work_tree(path)?);
            }
            for (_, d) in &members {
                if let Some(object_type) = d.object_type {
                    builder.line(&format!("PROMPT -- {} {}.{}", object_type, key.schema, d.object_name));
                }
                builder.reference(&d.path, self.snapshot(input.last_hash, &d.path)?);
                remaining.remove(d.path.as_str());
            }
            for path in &after {
                builder.reference(path, self.read_work_tree(path)?);
            }
            if !members.is_empty() {
                if let Some(fragment) = self.fragments.group_after(&group.name, &group_ctx)? {
                    builder.block(&fragment);
                }
            }
        }

        if !remaining.is_empty() {
            return Err(PatchError::NotAllFilesProcessed {
                files: remaining.into_iter().map(String::from).collect(),
            });
        }
        Ok(())
    }

    fn context(&self, key: &SchemaKey, identity: &PatchIdentity) -> TemplateContext {
        TemplateContext {
            schema: Some(key.schema.clone()),
            schema_key: Some(key.to_string()),
            app_id: key.application_id,
            workspace: self.config.application.workspace.clone(),
            patch_code: Some(identity.code.clone()),
            patch_date: Some(identity.date.clone()),
            patch_seq: Some(identity.sequence),
            patch_folder: Some(identity.folder_name()),
            log_file: Some(format!("{}.log", key)),
            marker: Some(self.config.script.marker.clone()),
            ..TemplateContext::default()
        }
    }

    /// Repository content at `commit`; a missing path is a configuration gap.
    pub(crate) fn snapshot(&self, commit: &str, path: &str) -> Result<Vec<u8>> {
        self.history
            .file_contents(commit, path)?
            .ok_or_else(|| PatchError::MissingFile(PathBuf::from(path)))
    }

    pub(crate) fn exists_at(&self, commit: &str, path: &str) -> Result<bool> {
        Ok(self.history.file_contents(commit, path)?.is_some())
    }

    fn read_work_tree(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.work_tree.join(path);
        match std::fs::read(&full) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PatchError::MissingFile(full)),
            Err(e) => Err(e.into()),
        }
    }

    /// `<scripts_root>/<code>/`
    fn adhoc_root(&self, code: &str) -> String {
        format!("{}{}/", as_prefix(&self.config.paths.scripts_root), code)
    }

    /// Schema keys that have an ad-hoc script folder for this patch code.
    fn adhoc_schema_keys(&self, code: &str) -> Result<Vec<SchemaKey>> {
        let dir = self.work_tree.join(self.adhoc_root(code));
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match name.parse::<SchemaKey>() {
                Ok(key) if key.application_id.is_none() => keys.push(key),
                _ => warn!(folder = %name, "ad-hoc script folder is not a schema name, skipped"),
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// `<scripts_root>/<code>/<SCHEMA>/<when>_<group>/*.sql`, sorted by name.
    fn adhoc_scripts(&self, code: &str, key: &SchemaKey, when: &str, group: &str) -> Result<Vec<String>> {
        let rel_dir = format!("{}{}/{}_{}/", self.adhoc_root(code), key, when, group);
        let entries = match std::fs::read_dir(self.work_tree.join(&rel_dir)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut scripts = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_file() && name.ends_with(".sql") {
                scripts.push(format!("{}{}", rel_dir, name));
            }
        }
        scripts.sort();
        Ok(scripts)
    }
}

/// Script and log file names start with the schema key and use spaces as
/// separators, so a schema folder must not contain whitespace.
fn check_schema_folder(descriptor: &ObjectDescriptor) -> Result<()> {
    if descriptor.schema_folder.chars().any(char::is_whitespace) {
        return Err(PatchError::Config(format!(
            "schema name '{}' of {} contains whitespace",
            descriptor.schema_folder, descriptor.path
        )));
    }
    Ok(())
}

/// Clears the patch folder, then writes snapshots and scripts.
pub fn write_patch(patch: &Patch, patch_root: &Path) -> Result<PathBuf> {
    let folder = patch_root.join(patch.identity.folder_name());
    if folder.exists() {
        warn!(folder = %folder.display(), "replacing existing patch folder");
        std::fs::remove_dir_all(&folder)?;
    }
    std::fs::create_dir_all(&folder)?;

    for (path, content) in &patch.snapshots {
        let target = folder.join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, content)?;
    }
    for (key, text) in &patch.scripts {
        std::fs::write(folder.join(format!("{}.sql", key)), text)?;
    }

    info!(
        folder = %folder.display(),
        scripts = patch.scripts.len(),
        snapshots = patch.snapshots.len(),
        "wrote patch"
    );
    Ok(folder)
}
