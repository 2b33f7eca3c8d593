//! Manifest ingestion: a pragmatic subset parser for the declarative
//! dependency manifest, per the Non-goal that excludes full DSL fidelity.
//!
//! Recognises the common declarative forms: `source "URL"`, and
//! `gem "name", "constraint", group: :x, git: "URL", branch: "b", tag: "t",
//! ref: "rev", path: "p"`. Anything else (conditionals, custom blocks,
//! plugin directives) is ignored rather than rejected, consistent with the
//! "supplementary, not authoritative" role this module plays relative to the
//! core pipeline.

use color_eyre::{Result, eyre::Context};
use lazy_regex::regex;

use crate::{
    model::{Comparator, DependencyRequest, Source},
    path::AbsDirPath,
};

/// The parsed manifest: declared sources plus dependency requests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    pub sources: Vec<url::Url>,
    pub dependencies: Vec<DependencyRequest>,
    pub ruby_version: Option<String>,
}

/// Parse a manifest body.
pub fn parse(contents: &str, project_root: &AbsDirPath) -> Result<Manifest> {
    let source_line = regex!(r#"^\s*source\s+["']([^"']+)["']"#m);
    let gem_line = regex!(r#"^\s*gem\s+["']([^"']+)["']\s*(?:,\s*["']([^"']+)["'])?(.*)$"#m);
    let ruby_line = regex!(r#"^\s*ruby\s+["']([^"']+)["']"#m);
    let kv = regex!(r#"(\w+):\s*(?:"([^"]*)"|'([^']*)'|:(\w+))"#);

    let mut manifest = Manifest::default();

    for cap in source_line.captures_iter(contents) {
        let url = url::Url::parse(&cap[1]).with_context(|| format!("parse source url: {}", &cap[1]))?;
        manifest.sources.push(url);
    }

    if let Some(cap) = ruby_line.captures(contents) {
        manifest.ruby_version = Some(cap[1].to_string());
    }

    for cap in gem_line.captures_iter(contents) {
        let name = cap[1].to_string();
        let constraint_raw = cap.get(2).map(|m| m.as_str().to_string());
        let trailer = cap.get(3).map(|m| m.as_str()).unwrap_or("");

        let mut groups = Vec::new();
        let mut git = None;
        let mut branch = None;
        let mut tag = None;
        let mut revision = None;
        let mut path = None;

        for kv_cap in kv.captures_iter(trailer) {
            let key = &kv_cap[1];
            let value = kv_cap
                .get(2)
                .or_else(|| kv_cap.get(3))
                .or_else(|| kv_cap.get(4))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            match key {
                "group" | "groups" => groups.push(value),
                "git" => git = Some(value),
                "branch" => branch = Some(value),
                "tag" => tag = Some(value),
                "ref" => revision = Some(value),
                "path" => path = Some(value),
                _ => {}
            }
        }

        let source = if let Some(git_url) = git {
            Some(Source::Repository {
                uri: url::Url::parse(&git_url).with_context(|| format!("parse git url: {git_url}"))?,
                branch,
                tag,
                revision: revision.unwrap_or_default(),
                submodules: false,
                glob: None,
            })
        } else if let Some(path) = path {
            let root = project_root.as_std_path().join(&path);
            Some(Source::Path {
                root: AbsDirPath::try_from(root).with_context(|| format!("resolve path source: {path}"))?,
                glob: None,
            })
        } else {
            None
        };

        let constraints = match constraint_raw {
            Some(raw) => parse_constraints(&raw)?,
            None => Vec::new(),
        };

        manifest.dependencies.push(DependencyRequest {
            name,
            constraints,
            groups,
            platforms: Vec::new(),
            source,
        });
    }

    Ok(manifest)
}

fn parse_constraints(raw: &str) -> Result<Vec<Comparator>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_comparator)
        .collect()
}

fn parse_comparator(raw: &str) -> Result<Comparator> {
    let raw = raw.trim();
    for (prefix, ctor) in [
        ("~>", Comparator::Pessimistic as fn(crate::model::Version) -> Comparator),
        (">=", Comparator::Gte),
        ("<=", Comparator::Lte),
        ("!=", Comparator::Neq),
        (">", Comparator::Gt),
        ("<", Comparator::Lt),
        ("=", Comparator::Eq),
    ] {
        if let Some(rest) = raw.strip_prefix(prefix) {
            return Ok(ctor(crate::model::Version::parse(rest.trim().to_string())));
        }
    }
    Ok(Comparator::Eq(crate::model::Version::parse(raw.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::AbsDirPath;

    fn root() -> AbsDirPath {
        AbsDirPath::try_from(std::env::temp_dir()).unwrap()
    }

    #[test]
    fn parses_source_and_simple_gem() {
        let manifest = parse(
            r#"
source "https://rubygems.org"
gem "rake", "~> 13.0"
"#,
            &root(),
        )
        .unwrap();
        assert_eq!(manifest.sources[0].as_str(), "https://rubygems.org/");
        assert_eq!(manifest.dependencies[0].name, "rake");
        assert_eq!(manifest.dependencies[0].constraints, vec![Comparator::Pessimistic(crate::model::Version::parse("13.0"))]);
    }

    #[test]
    fn parses_git_dependency_with_branch() {
        let manifest = parse(r#"gem "foo", git: "https://example.com/foo.git", branch: "main""#, &root()).unwrap();
        let dep = &manifest.dependencies[0];
        match dep.source.as_ref().unwrap() {
            Source::Repository { branch, .. } => assert_eq!(branch.as_deref(), Some("main")),
            _ => panic!("expected repository source"),
        }
    }

    #[test]
    fn parses_group_and_path_dependency() {
        let manifest = parse(r#"gem "local", path: "vendor/local", group: :development"#, &root()).unwrap();
        let dep = &manifest.dependencies[0];
        assert_eq!(dep.groups, vec!["development"]);
        assert!(matches!(dep.source, Some(Source::Path { .. })));
    }
}
