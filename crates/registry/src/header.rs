use std::collections::BTreeSet;

/// Commit ids listed in the `-- COMMITS:` block, which ends at a bare `--` line.
pub fn parse_commits(script: &str) -> BTreeSet<u64> {
    let mut commits = BTreeSet::new();
    let mut lines = script.lines().skip_while(|l| l.trim_end() != "-- COMMITS:");
    if lines.next().is_none() {
        return commits;
    }
    for line in lines {
        let line = line.trim_end();
        if line == "--" {
            break;
        }
        let entry = match line.strip_prefix("--") {
            Some(entry) => entry.trim_start(),
            None => break,
        };
        if let Some((id, _summary)) = entry.split_once(')') {
            if let Ok(id) = id.trim().parse::<u64>() {
                commits.insert(id);
            }
        }
    }
    commits
}

/// Repository paths of `@"./path"` lines.
pub fn parse_references(script: &str) -> BTreeSet<String> {
    script
        .lines()
        .filter_map(|l| l.trim().strip_prefix("@\"./"))
        .filter_map(|l| l.strip_suffix('"'))
        .map(String::from)
        .collect()
}
