//! Lock emitter: parses and writes the lockfile grammar described in §4.10/§6.
//!
//! The grammar is line-oriented and section-based, matching the on-disk
//! format this installer must stay bit-for-bit compatible with: named
//! sections (`GIT`, `PATH`, `GEM`, `PLATFORMS`, `DEPENDENCIES`, optional
//! `CHECKSUMS`, optional `RUBY VERSION`, `BUNDLED WITH`), two-space indented
//! fields, four-space indented spec lists with nested dependency lines
//! indented six spaces.

use std::collections::{BTreeMap, BTreeSet};

use color_eyre::{Result, eyre::Context};
use itertools::Itertools;

use crate::{
    fs,
    model::{ResolvedArtifact, Source},
    path::AbsFilePath,
};

/// One lockfile source-block: the sources's own descriptor fields, plus its
/// specs (each a name, version, platform, and dependency-name list).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockSection {
    pub source: Source,
    pub specs: Vec<LockSpec>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockSpec {
    pub name: String,
    pub version: String,
    pub platform: Option<String>,
    pub dependencies: Vec<String>,
}

/// A fully parsed (or to-be-written) lockfile.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockFile {
    pub git: Vec<LockSection>,
    pub path: Vec<LockSection>,
    pub gem: Vec<LockSection>,
    pub platforms: Vec<String>,
    pub dependencies: Vec<(String, bool)>,
    pub checksums: Vec<(String, String)>,
    pub ruby_version: Option<String>,
    pub bundled_with: Option<String>,
}

/// Build a [`LockFile`] from a resolved artifact set, grouping specs by
/// owning source and producing deterministic, sorted output.
pub fn from_resolved(artifacts: &[ResolvedArtifact], top_level: &[String], ruby_version: Option<String>, bundled_with: Option<String>) -> LockFile {
    let mut by_source: BTreeMap<String, (Source, Vec<LockSpec>)> = BTreeMap::new();
    for artifact in artifacts {
        let key = source_key(&artifact.source);
        let entry = by_source.entry(key).or_insert_with(|| (artifact.source.clone(), Vec::new()));
        entry.1.push(LockSpec {
            name: artifact.name.clone(),
            version: artifact.version.as_str().to_string(),
            platform: match &artifact.platform {
                crate::model::Platform::Portable => None,
                crate::model::Platform::Specific(p) => Some(p.clone()),
            },
            dependencies: artifact.dependencies.iter().map(|(n, _)| n.clone()).sorted().collect(),
        });
    }

    let mut git = Vec::new();
    let mut path = Vec::new();
    let mut gem = Vec::new();
    for (_, (source, mut specs)) in by_source {
        specs.sort_by(|a, b| (&a.name, &a.version, &a.platform).cmp(&(&b.name, &b.version, &b.platform)));
        let section = LockSection { source: source.clone(), specs };
        match source {
            Source::Repository { .. } => git.push(section),
            Source::Path { .. } => path.push(section),
            Source::Index { .. } => gem.push(section),
        }
    }

    let mut platforms: BTreeSet<String> = artifacts
        .iter()
        .filter_map(|a| match &a.platform {
            crate::model::Platform::Specific(p) => Some(p.clone()),
            crate::model::Platform::Portable => None,
        })
        .collect();
    platforms.insert("ruby".to_string());

    let pinned: BTreeSet<&str> = artifacts
        .iter()
        .filter(|a| !matches!(a.source, Source::Index { .. }))
        .map(|a| a.name.as_str())
        .collect();

    let dependencies = top_level
        .iter()
        .sorted()
        .map(|name| (name.clone(), pinned.contains(name.as_str())))
        .collect();

    LockFile {
        git,
        path,
        gem,
        platforms: platforms.into_iter().sorted().collect(),
        dependencies,
        checksums: Vec::new(),
        ruby_version,
        bundled_with,
    }
}

fn source_key(source: &Source) -> String {
    match source {
        Source::Index { roots } => format!("gem:{}", roots.first().map(|u| u.as_str()).unwrap_or_default()),
        Source::Repository { uri, revision, .. } => format!("git:{uri}:{revision}"),
        Source::Path { root, .. } => format!("path:{}", root.as_std_path().display()),
    }
}

/// Render a [`LockFile`] to its canonical text form.
pub fn render(lock: &LockFile) -> String {
    let mut out = String::new();

    for section in &lock.git {
        if let Source::Repository { uri, branch, tag, revision, .. } = &section.source {
            out.push_str("GIT\n");
            out.push_str(&format!("  remote: {uri}\n"));
            out.push_str(&format!("  revision: {revision}\n"));
            if let Some(branch) = branch {
                out.push_str(&format!("  branch: {branch}\n"));
            }
            if let Some(tag) = tag {
                out.push_str(&format!("  tag: {tag}\n"));
            }
            render_specs(&mut out, &section.specs);
            out.push('\n');
        }
    }

    for section in &lock.path {
        if let Source::Path { root, .. } = &section.source {
            out.push_str("PATH\n");
            out.push_str(&format!("  remote: {}\n", root.as_std_path().display()));
            render_specs(&mut out, &section.specs);
            out.push('\n');
        }
    }

    if !lock.gem.is_empty() {
        out.push_str("GEM\n");
        for section in &lock.gem {
            if let Source::Index { roots } = &section.source {
                for root in roots {
                    out.push_str(&format!("  remote: {root}\n"));
                }
            }
            render_specs(&mut out, &section.specs);
        }
        out.push('\n');
    }

    out.push_str("PLATFORMS\n");
    for platform in &lock.platforms {
        out.push_str(&format!("  {platform}\n"));
    }
    out.push('\n');

    out.push_str("DEPENDENCIES\n");
    for (name, pinned) in &lock.dependencies {
        if *pinned {
            out.push_str(&format!("  {name}!\n"));
        } else {
            out.push_str(&format!("  {name}\n"));
        }
    }
    out.push('\n');

    if !lock.checksums.is_empty() {
        out.push_str("CHECKSUMS\n");
        for (name, hash) in lock.checksums.iter().sorted() {
            out.push_str(&format!("  {name} {hash}\n"));
        }
        out.push('\n');
    }

    if let Some(version) = &lock.ruby_version {
        out.push_str("RUBY VERSION\n");
        out.push_str(&format!("   {version}\n"));
        out.push('\n');
    }

    if let Some(version) = &lock.bundled_with {
        out.push_str("BUNDLED WITH\n");
        out.push_str(&format!("   {version}\n"));
    }

    out
}

fn render_specs(out: &mut String, specs: &[LockSpec]) {
    out.push_str("  specs:\n");
    for spec in specs {
        let suffix = spec.platform.as_ref().map(|p| format!("-{p}")).unwrap_or_default();
        out.push_str(&format!("    {} ({}{suffix})\n", spec.name, spec.version));
        for dep in &spec.dependencies {
            out.push_str(&format!("      {dep}\n"));
        }
    }
}

/// Parse a lockfile's canonical text form.
pub fn parse(text: &str) -> Result<LockFile> {
    let mut lock = LockFile::default();
    let mut lines = text.lines().peekable();
    let mut current_section: Option<String> = None;
    let mut pending: Option<(Source, Vec<LockSpec>)> = None;

    let flush = |lock: &mut LockFile, section: &Option<String>, pending: Option<(Source, Vec<LockSpec>)>| {
        let Some((source, specs)) = pending else { return };
        let entry = LockSection { source: source.clone(), specs };
        match section.as_deref() {
            Some("GIT") => lock.git.push(entry),
            Some("PATH") => lock.path.push(entry),
            Some("GEM") => lock.gem.push(entry),
            _ => {}
        }
    };

    while let Some(line) = lines.next() {
        if line.is_empty() {
            flush(&mut lock, &current_section, pending.take());
            continue;
        }
        if !line.starts_with(' ') {
            flush(&mut lock, &current_section, pending.take());
            current_section = Some(line.trim().to_string());
            continue;
        }

        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();

        match current_section.as_deref() {
            Some("GIT") | Some("PATH") | Some("GEM") => {
                if indent == 2 && trimmed.starts_with("remote:") {
                    let remote = trimmed.trim_start_matches("remote:").trim().to_string();
                    let source = match current_section.as_deref() {
                        Some("GIT") => Source::Repository {
                            uri: url::Url::parse(&remote).context("parse git remote url")?,
                            branch: None,
                            tag: None,
                            revision: String::new(),
                            submodules: false,
                            glob: None,
                        },
                        Some("PATH") => Source::Path {
                            root: crate::path::AbsDirPath::try_from(std::path::PathBuf::from(&remote))
                                .context("parse path remote")?,
                            glob: None,
                        },
                        _ => Source::Index {
                            roots: vec![url::Url::parse(&remote).context("parse gem remote url")?],
                        },
                    };
                    match &mut pending {
                        Some((existing, _)) if matches!(existing, Source::Index { .. }) && matches!(source, Source::Index { .. }) => {
                            if let (Source::Index { roots }, Source::Index { roots: new_roots }) = (existing, source) {
                                roots.extend(new_roots);
                            }
                        }
                        _ => pending = Some((source, Vec::new())),
                    }
                } else if indent == 2 && trimmed.starts_with("revision:") {
                    if let Some((Source::Repository { revision, .. }, _)) = &mut pending {
                        *revision = trimmed.trim_start_matches("revision:").trim().to_string();
                    }
                } else if indent == 2 && trimmed.starts_with("branch:") {
                    if let Some((Source::Repository { branch, .. }, _)) = &mut pending {
                        *branch = Some(trimmed.trim_start_matches("branch:").trim().to_string());
                    }
                } else if indent == 2 && trimmed.starts_with("tag:") {
                    if let Some((Source::Repository { tag, .. }, _)) = &mut pending {
                        *tag = Some(trimmed.trim_start_matches("tag:").trim().to_string());
                    }
                } else if indent == 4 {
                    if let Some((_, specs)) = &mut pending {
                        specs.push(parse_spec_line(trimmed)?);
                    }
                } else if indent == 6 {
                    if let Some((_, specs)) = &mut pending {
                        if let Some(last) = specs.last_mut() {
                            last.dependencies.push(trimmed.to_string());
                        }
                    }
                }
            }
            Some("PLATFORMS") => lock.platforms.push(trimmed.to_string()),
            Some("DEPENDENCIES") => {
                if let Some(name) = trimmed.strip_suffix('!') {
                    lock.dependencies.push((name.to_string(), true));
                } else {
                    lock.dependencies.push((trimmed.to_string(), false));
                }
            }
            Some("CHECKSUMS") => {
                if let Some((name, hash)) = trimmed.split_once(' ') {
                    lock.checksums.push((name.to_string(), hash.to_string()));
                }
            }
            Some("RUBY VERSION") => lock.ruby_version = Some(trimmed.to_string()),
            Some("BUNDLED WITH") => lock.bundled_with = Some(trimmed.to_string()),
            _ => {}
        }
    }
    flush(&mut lock, &current_section, pending.take());

    Ok(lock)
}

fn parse_spec_line(trimmed: &str) -> Result<LockSpec> {
    let (name, rest) = trimmed.split_once(' ').context("malformed spec line")?;
    let version_platform = rest.trim().trim_start_matches('(').trim_end_matches(')');
    let (version, platform) = match version_platform.split_once('-') {
        Some((v, p)) => (v.to_string(), Some(p.to_string())),
        None => (version_platform.to_string(), None),
    };
    Ok(LockSpec { name: name.to_string(), version, platform, dependencies: Vec::new() })
}

/// Write a lockfile atomically to `path`.
pub async fn write(path: &AbsFilePath, lock: &LockFile) -> Result<()> {
    fs::atomic_write(path, render(lock).as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Platform, Version};

    fn gem_artifact(name: &str, version: &str) -> ResolvedArtifact {
        ResolvedArtifact {
            name: name.to_string(),
            version: Version::parse(version),
            platform: Platform::Portable,
            dependencies: vec![],
            source: Source::Index { roots: vec![url::Url::parse("https://rubygems.org/").unwrap()] },
            needs_compilation: false,
            content_hash: None,
        }
    }

    #[test]
    fn renders_gem_section_and_dependencies() {
        let artifacts = vec![gem_artifact("rake", "13.0.6"), gem_artifact("thor", "1.2.1")];
        let lock = from_resolved(&artifacts, &["rake".to_string()], Some("ruby 3.3.0p0".to_string()), Some("2.5.6".to_string()));
        let text = render(&lock);
        assert!(text.contains("GEM\n  remote: https://rubygems.org/\n  specs:\n    rake (13.0.6)\n    thor (1.2.1)\n"));
        assert!(text.contains("DEPENDENCIES\n  rake\n"));
        assert!(text.contains("RUBY VERSION\n   ruby 3.3.0p0\n"));
        assert!(text.contains("BUNDLED WITH\n   2.5.6"));
    }

    #[test]
    fn round_trips_through_parse() {
        let artifacts = vec![gem_artifact("rake", "13.0.6")];
        let lock = from_resolved(&artifacts, &["rake".to_string()], None, None);
        let text = render(&lock);
        let parsed = parse(&text).unwrap();
        assert_eq!(parsed.gem.len(), 1);
        assert_eq!(parsed.gem[0].specs[0].name, "rake");
        assert_eq!(parsed.dependencies, vec![("rake".to_string(), false)]);
    }
}
