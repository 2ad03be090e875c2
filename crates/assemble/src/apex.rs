use schemapatch_types::{AppPolicy, ObjectDescriptor, Result, SchemaKey};
use tracing::debug;

use crate::assembler::{Assembler, ScriptBuilder};
use crate::template::TemplateContext;

const SET_ENVIRONMENT: &str = "application/set_environment.sql";
const END_ENVIRONMENT: &str = "application/end_environment.sql";

/// `.../f<id>/` prefix of an export path.
fn application_dir(path: &str, app_id: u32) -> Option<String> {
    let folder = format!("f{}", app_id);
    let segments: Vec<&str> = path.split('/').collect();
    let pos = segments[..segments.len().saturating_sub(1)]
        .iter()
        .position(|s| *s == folder)?;
    Some(format!("{}/", segments[..=pos].join("/")))
}

/// Application scripts skip group ordering: init, then either the full export or
/// the changed components with pages recreated last, then the end fragment.
pub(crate) fn emit_application(
    asm: &Assembler<'_>,
    builder: &mut ScriptBuilder,
    key: &SchemaKey,
    files: &[ObjectDescriptor],
    ctx: &TemplateContext,
    last_hash: &str,
) -> Result<()> {
    let app_id = match key.application_id {
        Some(id) => id,
        None => return Ok(()),
    };
    let app_dir = match files.iter().find_map(|d| application_dir(&d.path, app_id)) {
        Some(dir) => dir,
        None => return Ok(()),
    };
    let full_export = format!("{}f{}.sql", app_dir, app_id);

    builder.line("");
    builder.block(&asm.fragments().apex_init(ctx)?);

    if asm.config().application.policy == AppPolicy::Full {
        debug!(app_id, "reinstalling full application");
        builder.reference(&full_export, asm.snapshot(last_hash, &full_export)?);
        builder.block(&asm.fragments().apex_end(ctx)?);
        return Ok(());
    }

    let set_env = format!("{}{}", app_dir, SET_ENVIRONMENT);
    let end_env = format!("{}{}", app_dir, END_ENVIRONMENT);

    let mut components: Vec<&ObjectDescriptor> = Vec::new();
    let mut pages: Vec<(u32, &ObjectDescriptor)> = Vec::new();
    for d in files {
        if d.path == set_env || d.path == end_env {
            continue;
        }
        if d.path == full_export {
            debug!(path = %d.path, "full export ignored under split policy");
            continue;
        }
        match d.page_id {
            Some(page_id) => pages.push((page_id, d)),
            None => components.push(d),
        }
    }
    components.sort_by(|a, b| a.path.cmp(&b.path));
    pages.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.path.cmp(&b.1.path)));

    if asm.exists_at(last_hash, &set_env)? {
        builder.reference(&set_env, asm.snapshot(last_hash, &set_env)?);
    }
    for d in components {
        builder.reference(&d.path, asm.snapshot(last_hash, &d.path)?);
    }
    for (page_id, d) in pages {
        let mut page_ctx = ctx.clone();
        page_ctx.page_id = Some(page_id);
        builder.block(&asm.fragments().apex_remove_page(&page_ctx)?);
        builder.reference(&d.path, asm.snapshot(last_hash, &d.path)?);
    }
    if asm.exists_at(last_hash, &end_env)? {
        builder.reference(&end_env, asm.snapshot(last_hash, &end_env)?);
    }

    builder.block(&asm.fragments().apex_end(ctx)?);
    Ok(())
}
