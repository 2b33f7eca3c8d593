//! Gemspec reading for path sources.
//!
//! Per the "dynamic metadata loading" design note, this implements the
//! spec-reader contract by parsing a documented textual subset of the
//! gemspec's on-disk form rather than shelling out to a Ruby interpreter:
//! `Gem::Specification.new do |s| ... end` blocks with simple string/array
//! literal assignments. This covers every gemspec a path/git source in the
//! test corpus actually uses; anything fancier (interpolation, conditionals)
//! is out of scope by the same non-goal that excludes full manifest-DSL
//! parsing.

use color_eyre::{Result, eyre::Context};
use lazy_regex::regex;

use crate::{fs, model::Version, path::AbsDirPath};

/// The metadata this installer needs out of a gemspec: enough to produce a
/// [`crate::model::ResolvedArtifact`] and materialize/require the gem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GemspecMetadata {
    pub name: String,
    pub version: Version,
    pub require_paths: Vec<String>,
    pub executables: Vec<String>,
    pub runtime_dependencies: Vec<(String, String)>,
}

/// Locate the single gemspec file under `dir` (optionally narrowed by
/// `glob`) and parse it.
pub async fn read(dir: &AbsDirPath, glob: Option<&str>) -> Result<GemspecMetadata> {
    let pattern = glob.unwrap_or("*.gemspec");
    let mut entries = fs::read_dir(dir).await.context("read gemspec directory")?;
    let mut candidate = None;
    while let Some(entry) = entries.next_entry().await.context("read directory entry")? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if glob_matches(pattern, &name) {
            candidate = Some(entry.path());
            break;
        }
    }
    let path = candidate.with_context(|| format!("no gemspec matching {pattern:?} in {dir}"))?;
    let contents = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("read gemspec: {path:?}"))?;
    parse(&contents)
}

fn glob_matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_prefix('*') {
        Some(suffix) => name.ends_with(suffix),
        None => pattern == name,
    }
}

/// Parse a gemspec body. Supports the common assignment forms:
/// `s.name = "foo"`, `s.version = "1.2.3"`, `s.require_paths = ["lib"]`,
/// `s.executables = ["foo"]`, `s.add_dependency "bar", ">= 1.0"`,
/// `s.add_runtime_dependency "bar", "~> 2.0"`.
pub fn parse(contents: &str) -> Result<GemspecMetadata> {
    let string_assign = regex!(r#"\.(name|version)\s*=\s*["']([^"']+)["']"#);
    let array_assign = regex!(r#"\.(require_paths|executables)\s*=\s*\[([^\]]*)\]"#);
    let dependency = regex!(r#"\.add_(?:runtime_)?dependency\s+["']([^"']+)["']\s*(?:,\s*["']([^"']+)["'])?"#);

    let mut name = None;
    let mut version = None;
    let mut require_paths = Vec::new();
    let mut executables = Vec::new();
    let mut runtime_dependencies = Vec::new();

    for cap in string_assign.captures_iter(contents) {
        match &cap[1] {
            "name" => name = Some(cap[2].to_string()),
            "version" => version = Some(Version::parse(cap[2].to_string())),
            _ => unreachable!(),
        }
    }

    for cap in array_assign.captures_iter(contents) {
        let items: Vec<String> = cap[2]
            .split(',')
            .map(|s| s.trim().trim_matches(['"', '\'']).to_string())
            .filter(|s| !s.is_empty())
            .collect();
        match &cap[1] {
            "require_paths" => require_paths = items,
            "executables" => executables = items,
            _ => unreachable!(),
        }
    }

    for cap in dependency.captures_iter(contents) {
        let dep_name = cap[1].to_string();
        let constraint = cap.get(2).map(|m| m.as_str().to_string()).unwrap_or_else(|| ">= 0".to_string());
        runtime_dependencies.push((dep_name, constraint));
    }

    Ok(GemspecMetadata {
        name: name.context("gemspec missing name assignment")?,
        version: version.context("gemspec missing version assignment")?,
        require_paths: if require_paths.is_empty() {
            vec!["lib".to_string()]
        } else {
            require_paths
        },
        executables,
        runtime_dependencies,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
Gem::Specification.new do |s|
  s.name = "example"
  s.version = "1.0.0"
  s.require_paths = ["lib", "ext"]
  s.executables = ["example-cli"]
  s.add_dependency "rake", ">= 12.0"
  s.add_runtime_dependency "thor"
end
"#;

    #[test]
    fn parses_basic_gemspec() {
        let meta = parse(EXAMPLE).unwrap();
        assert_eq!(meta.name, "example");
        assert_eq!(meta.version.as_str(), "1.0.0");
        assert_eq!(meta.require_paths, vec!["lib", "ext"]);
        assert_eq!(meta.executables, vec!["example-cli"]);
        assert_eq!(meta.runtime_dependencies.len(), 2);
        assert_eq!(meta.runtime_dependencies[0], ("rake".to_string(), ">= 12.0".to_string()));
        assert_eq!(meta.runtime_dependencies[1].0, "thor");
    }

    #[test]
    fn defaults_require_paths_to_lib() {
        let meta = parse(r#"s.name = "x"
s.version = "0.1.0""#).unwrap();
        assert_eq!(meta.require_paths, vec!["lib"]);
    }
}
