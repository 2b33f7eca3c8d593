//! Parsing for the three compact-index wire formats: `names`, `versions`,
//! and per-gem `info`.

use std::collections::BTreeMap;

use color_eyre::{Result, eyre::Context};

use crate::model::{Comparator, Platform, Version};

/// A single `versions` record: a gem name, its known version tokens (with
/// deletions applied), and the fingerprint used to skip redundant `info`
/// fetches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionsRecord {
    pub name: String,
    pub versions: Vec<(Version, Platform)>,
    pub fingerprint: String,
}

/// Parse the `names` endpoint body: one gem name per line, header stripped.
pub fn parse_names(body: &str) -> Vec<String> {
    strip_header(body)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse (and apply) the `versions` endpoint body against a running index.
///
/// `index` is mutated in place: additions append/replace, and tokens
/// prefixed with `-` remove a previously published version.
pub fn apply_versions(body: &str, index: &mut BTreeMap<String, VersionsRecord>) -> Result<()> {
    for line in strip_header(body).lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, ' ');
        let name = parts.next().context("versions record missing name")?;
        let versions_field = parts.next().context("versions record missing versions")?;
        let fingerprint = parts.next().unwrap_or_default().to_string();

        let entry = index.entry(name.to_string()).or_insert_with(|| VersionsRecord {
            name: name.to_string(),
            versions: Vec::new(),
            fingerprint: String::new(),
        });
        entry.fingerprint = fingerprint;

        for token in versions_field.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if let Some(deleted) = token.strip_prefix('-') {
                let (version, platform) = split_platform(deleted);
                entry
                    .versions
                    .retain(|(v, p)| !(v.as_str() == version.as_str() && p == &platform));
            } else {
                let (version, platform) = split_platform(token);
                entry.versions.push((version, platform));
            }
        }
    }
    Ok(())
}

fn split_platform(token: &str) -> (Version, Platform) {
    match token.split_once('-') {
        Some((version, platform)) if !platform.is_empty() && platform.chars().next().is_some_and(|c| !c.is_ascii_digit()) => {
            (Version::parse(version), Platform::parse(platform))
        }
        _ => (Version::parse(token), Platform::Portable),
    }
}

/// A single parsed `info/<name>` record for one version/platform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InfoRecord {
    pub version: Version,
    pub platform: Platform,
    pub dependencies: Vec<(String, Vec<Comparator>)>,
    pub requirements: Vec<(String, Vec<Comparator>)>,
}

/// Parse an `info/<name>` endpoint body into one record per line.
pub fn parse_info(body: &str) -> Result<Vec<InfoRecord>> {
    let mut records = Vec::new();
    for line in strip_header(body).lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        records.push(parse_info_line(line)?);
    }
    Ok(records)
}

fn parse_info_line(line: &str) -> Result<InfoRecord> {
    let mut head_rest = line.splitn(2, ' ');
    let head = head_rest.next().context("info record missing version token")?;
    let rest = head_rest.next().unwrap_or_default();
    let (version, platform) = split_platform(head);

    let (deps_str, reqs_str) = rest.split_once('|').unwrap_or((rest, ""));

    let dependencies = parse_dep_list(deps_str, ':', '&')?;
    let requirements = parse_dep_list(reqs_str, ':', '&')?;

    Ok(InfoRecord {
        version,
        platform,
        dependencies,
        requirements,
    })
}

fn parse_dep_list(
    raw: &str,
    name_sep: char,
    constraint_sep: char,
) -> Result<Vec<(String, Vec<Comparator>)>> {
    let mut out = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (name, constraints_raw) = entry
            .split_once(name_sep)
            .with_context(|| format!("malformed dependency entry: {entry}"))?;
        let constraints = constraints_raw
            .split(constraint_sep)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(parse_comparator)
            .collect::<Result<Vec<_>>>()?;
        out.push((name.to_string(), constraints));
    }
    Ok(out)
}

fn parse_comparator(raw: &str) -> Result<Comparator> {
    let raw = raw.trim();
    for (prefix, ctor) in [
        ("~>", Comparator::Pessimistic as fn(Version) -> Comparator),
        (">=", Comparator::Gte),
        ("<=", Comparator::Lte),
        ("!=", Comparator::Neq),
        (">", Comparator::Gt),
        ("<", Comparator::Lt),
        ("=", Comparator::Eq),
    ] {
        if let Some(rest) = raw.strip_prefix(prefix) {
            return Ok(ctor(Version::parse(rest.trim())));
        }
    }
    Ok(Comparator::Eq(Version::parse(raw)))
}

fn strip_header(body: &str) -> &str {
    match body.split_once("---\n") {
        Some((_, rest)) => rest,
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names() {
        let body = "---\na\nb\nc\n";
        assert_eq!(parse_names(body), vec!["a", "b", "c"]);
    }

    #[test]
    fn applies_version_additions_and_deletions() {
        let mut index = BTreeMap::new();
        apply_versions("---\nrake 13.0.1,13.0.2 abc123\n", &mut index).unwrap();
        assert_eq!(index["rake"].versions.len(), 2);

        apply_versions("rake -13.0.1,13.0.3 def456\n", &mut index).unwrap();
        let versions: Vec<_> = index["rake"]
            .versions
            .iter()
            .map(|(v, _)| v.as_str().to_string())
            .collect();
        assert_eq!(versions, vec!["13.0.2", "13.0.3"]);
        assert_eq!(index["rake"].fingerprint, "def456");
    }

    #[test]
    fn parses_info_record_with_deps_and_reqs() {
        let records = parse_info("---\n1.2.3 activesupport:>= 5.0,< 8.0|ruby:>= 2.7\n").unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.version.as_str(), "1.2.3");
        assert_eq!(record.dependencies.len(), 1);
        assert_eq!(record.dependencies[0].0, "activesupport");
        assert_eq!(record.dependencies[0].1.len(), 2);
        assert_eq!(record.requirements.len(), 1);
        assert_eq!(record.requirements[0].0, "ruby");
    }

    #[test]
    fn defaults_missing_platform_to_ruby() {
        let (_, platform) = split_platform("1.2.3");
        assert!(platform.is_portable());
    }
}
