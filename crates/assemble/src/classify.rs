use schemapatch_types::{Config, ObjectDescriptor};

/// Reads the path conventions of the object and application-export roots.
///
/// Never fails: a path that matches no convention comes back with
/// `object_type == None` and is left for the caller to judge.
pub fn classify(path: &str, config: &Config) -> ObjectDescriptor {
    let mut descriptor = ObjectDescriptor {
        path: path.to_string(),
        object_name: object_name(basename(path), None),
        ..ObjectDescriptor::default()
    };

    let app_prefix = config.paths.app_prefix();
    let object_prefix = config.paths.object_prefix();

    if let Some(rest) = path.strip_prefix(app_prefix.as_str()) {
        if let Some(app_id) = application_id(rest) {
            descriptor.is_application_export = true;
            descriptor.application_id = Some(app_id);
            descriptor.page_id = page_id(rest);
            descriptor.schema_folder = config
                .application
                .schema_for(app_id)
                .unwrap_or_default()
                .to_string();
            return descriptor;
        }
    }

    if let Some(rest) = path.strip_prefix(object_prefix.as_str()) {
        let segments: Vec<&str> = rest.split('/').collect();
        if segments.len() < 3 || segments.iter().any(|s| s.is_empty()) {
            return descriptor;
        }
        descriptor.is_database_object = true;
        descriptor.schema_folder = segments[0].to_string();

        let folder = segments[1];
        let file = basename(path);
        let best = config
            .object_types
            .iter()
            .filter(|t| t.folder == folder)
            .flat_map(|t| t.extensions.iter().map(move |ext| (t.object_type, ext)))
            .filter(|(_, ext)| file.len() > ext.len() && file.ends_with(ext.as_str()))
            .max_by_key(|(_, ext)| ext.len());

        if let Some((object_type, ext)) = best {
            descriptor.object_type = Some(object_type);
            descriptor.object_name = object_name(file, Some(ext.as_str()));
        }
    }

    descriptor
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn object_name(file: &str, extension: Option<&str>) -> String {
    let stem = match extension.and_then(|ext| file.strip_suffix(ext)) {
        Some(stem) => stem,
        None => file.split_once('.').map(|(stem, _)| stem).unwrap_or(file),
    };
    stem.to_uppercase()
}

/// First `f<digits>` folder segment (never the file name itself).
fn application_id(rest: &str) -> Option<u32> {
    let segments: Vec<&str> = rest.split('/').collect();
    let folders = &segments[..segments.len().saturating_sub(1)];
    folders.iter().find_map(|s| {
        let digits = s.strip_prefix('f')?;
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    })
}

/// `.../pages/page_<digits>.sql`
fn page_id(rest: &str) -> Option<u32> {
    let mut segments = rest.rsplit('/');
    let file = segments.next()?;
    if segments.next()? != "pages" {
        return None;
    }
    let digits = file.strip_prefix("page_")?.strip_suffix(".sql")?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
