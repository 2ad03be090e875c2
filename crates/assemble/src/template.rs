//! `{$NAME}` placeholders and the fragment files that use them.
//!
//! The placeholder set is closed: a tag outside [`Placeholder`], or one whose
//! value the current context does not carry, is an error rather than text
//! left in the generated script.

use std::path::{Path, PathBuf};

use schemapatch_types::{PatchError, Result};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    Schema,
    SchemaKey,
    AppId,
    PageId,
    Workspace,
    PatchCode,
    PatchDate,
    PatchSeq,
    PatchFolder,
    LogFile,
    Marker,
    Group,
}

impl Placeholder {
    pub const ALL: [Placeholder; 12] = [
        Placeholder::Schema,
        Placeholder::SchemaKey,
        Placeholder::AppId,
        Placeholder::PageId,
        Placeholder::Workspace,
        Placeholder::PatchCode,
        Placeholder::PatchDate,
        Placeholder::PatchSeq,
        Placeholder::PatchFolder,
        Placeholder::LogFile,
        Placeholder::Marker,
        Placeholder::Group,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Placeholder::Schema => "SCHEMA",
            Placeholder::SchemaKey => "SCHEMA_KEY",
            Placeholder::AppId => "APP_ID",
            Placeholder::PageId => "PAGE_ID",
            Placeholder::Workspace => "WORKSPACE",
            Placeholder::PatchCode => "PATCH_CODE",
            Placeholder::PatchDate => "PATCH_DATE",
            Placeholder::PatchSeq => "PATCH_SEQ",
            Placeholder::PatchFolder => "PATCH_FOLDER",
            Placeholder::LogFile => "LOG_FILE",
            Placeholder::Marker => "MARKER",
            Placeholder::Group => "GROUP",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Placeholder::ALL.iter().copied().find(|p| p.name() == name)
    }
}

/// Values available while rendering one fragment.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub schema: Option<String>,
    pub schema_key: Option<String>,
    pub app_id: Option<u32>,
    pub page_id: Option<u32>,
    pub workspace: Option<String>,
    pub patch_code: Option<String>,
    pub patch_date: Option<String>,
    pub patch_seq: Option<u32>,
    pub patch_folder: Option<String>,
    pub log_file: Option<String>,
    pub marker: Option<String>,
    pub group: Option<String>,
}

impl TemplateContext {
    pub fn value(&self, placeholder: Placeholder) -> Option<String> {
        match placeholder {
            Placeholder::Schema => self.schema.clone(),
            Placeholder::SchemaKey => self.schema_key.clone(),
            Placeholder::AppId => self.app_id.map(|v| v.to_string()),
            Placeholder::PageId => self.page_id.map(|v| v.to_string()),
            Placeholder::Workspace => self.workspace.clone(),
            Placeholder::PatchCode => self.patch_code.clone(),
            Placeholder::PatchDate => self.patch_date.clone(),
            Placeholder::PatchSeq => self.patch_seq.map(|v| format!("{:02}", v)),
            Placeholder::PatchFolder => self.patch_folder.clone(),
            Placeholder::LogFile => self.log_file.clone(),
            Placeholder::Marker => self.marker.clone(),
            Placeholder::Group => self.group.clone(),
        }
    }
}

pub fn render(text: &str, ctx: &TemplateContext, source_name: &str) -> Result<String> {
    let unresolved = |tag: &str| PatchError::UnresolvedTag {
        tag: tag.to_string(),
        source_name: source_name.to_string(),
    };

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{$") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| unresolved(after.lines().next().unwrap_or("")))?;
        let tag = &after[..end];
        let value = Placeholder::from_name(tag)
            .and_then(|p| ctx.value(p))
            .ok_or_else(|| unresolved(tag))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

// ── Fragments ─────────────────────────────────────────────────────────────

const APEX_INIT: &str = "\
PROMPT -- APPLICATION {$APP_ID}
BEGIN
    apex_application_install.set_workspace('{$WORKSPACE}');
    apex_application_install.set_application_id({$APP_ID});
    apex_application_install.set_schema('{$SCHEMA}');
    apex_application_install.set_auto_install_sup_obj(p_auto_install_sup_obj => FALSE);
END;
/
";

const APEX_REMOVE_PAGE: &str = "\
PROMPT -- REMOVE PAGE {$PAGE_ID}
BEGIN
    wwv_flow_imp_page.remove_page(p_flow_id => {$APP_ID}, p_page_id => {$PAGE_ID});
END;
/
";

const APEX_END: &str = "\
BEGIN
    apex_application_install.clear_all;
END;
/
";

/// Fixed fragments under the template root of the working tree.
///
/// `<group>.before.sql` / `<group>.after.sql` wrap database-object groups;
/// `apex.init.sql`, `apex.remove_page.sql` and `apex.end.sql` replace the
/// built-in application fragments when present.
#[derive(Debug, Clone)]
pub struct Fragments {
    root: PathBuf,
}

impl Fragments {
    pub fn new(root: &Path) -> Self {
        Fragments {
            root: root.to_path_buf(),
        }
    }

    fn read(&self, file_name: &str) -> Result<Option<(String, String)>> {
        let path = self.root.join(file_name);
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                debug!(path = %path.display(), "loaded fragment");
                Ok(Some((text, path.display().to_string())))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn render_optional(&self, file_name: &str, ctx: &TemplateContext) -> Result<Option<String>> {
        match self.read(file_name)? {
            Some((text, source)) => Ok(Some(render(&text, ctx, &source)?)),
            None => Ok(None),
        }
    }

    fn render_or_builtin(&self, file_name: &str, builtin: &str, ctx: &TemplateContext) -> Result<String> {
        match self.read(file_name)? {
            Some((text, source)) => render(&text, ctx, &source),
            None => render(builtin, ctx, &format!("built-in {}", file_name)),
        }
    }

    pub fn group_before(&self, group: &str, ctx: &TemplateContext) -> Result<Option<String>> {
        self.render_optional(&format!("{}.before.sql", group), ctx)
    }

    pub fn group_after(&self, group: &str, ctx: &TemplateContext) -> Result<Option<String>> {
        self.render_optional(&format!("{}.after.sql", group), ctx)
    }

    pub fn apex_init(&self, ctx: &TemplateContext) -> Result<String> {
        self.render_or_builtin("apex.init.sql", APEX_INIT, ctx)
    }

    pub fn apex_remove_page(&self, ctx: &TemplateContext) -> Result<String> {
        self.render_or_builtin("apex.remove_page.sql", APEX_REMOVE_PAGE, ctx)
    }

    pub fn apex_end(&self, ctx: &TemplateContext) -> Result<String> {
        self.render_or_builtin("apex.end.sql", APEX_END, ctx)
    }
}
