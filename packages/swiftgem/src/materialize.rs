//! The materializer: projects a promoted cache entry into the project-local
//! directory per §4.9. Uses [`fs::clone_tree`]/[`fs::clone_file`], which
//! already implement the reflink → hardlink → copy fallback chain this
//! component needs.

use color_eyre::{Result, eyre::Context};
use tracing::instrument;

use crate::{
    cache::Cache,
    fs,
    model::{Abi, PlanAction, PlanEntry, Source},
    planner::ProjectLayout,
};

/// Materialize a single plan entry. `skip` does nothing; `download`/`link`/
/// `build_ext` entries (the latter two implying a cached entry now exists)
/// project the cached tree, spec file, and extension subtree (if present)
/// into the project-local directory. Path sources are never projected:
/// their load paths point directly at the source location.
#[instrument(skip(cache, layout), fields(artifact = %entry.artifact.full_name()))]
pub async fn materialize_one(
    cache: &Cache,
    layout: &ProjectLayout,
    abi: &Abi,
    arch: &str,
    ext_api: &str,
    entry: &PlanEntry,
) -> Result<()> {
    if entry.action == PlanAction::Skip {
        return Ok(());
    }
    if matches!(entry.artifact.source, Source::Path { .. }) {
        return Ok(());
    }

    let full_name = entry.artifact.full_name();
    let cached_dir = cache.cached(abi, &full_name).context("compute cached dir")?;
    let gem_dir = layout.gem_dir(&full_name).context("compute project gem dir")?;
    fs::clone_tree(&cached_dir, &gem_dir).await.context("project cached gem tree")?;

    let cached_spec = cache.cached_spec(abi, &full_name).context("compute cached spec path")?;
    if fs::exists(cached_spec.as_std_path()).await {
        let spec_file = layout.spec_file(&full_name).context("compute project spec path")?;
        fs::clone_file(&cached_spec, &spec_file).await.context("project spec file")?;
    }

    if entry.artifact.needs_compilation {
        let ext_dir = layout.extension_dir(arch, ext_api, &full_name).context("compute project extension dir")?;
        if fs::is_dir(cached_dir.as_std_path()).await {
            fs::clone_tree(&cached_dir, &ext_dir).await.context("project extension subtree")?;
        }
    }

    Ok(())
}

/// Materialize every non-skip entry in a plan.
#[instrument(skip(cache, layout, entries))]
pub async fn materialize_all(
    cache: &Cache,
    layout: &ProjectLayout,
    abi: &Abi,
    arch: &str,
    ext_api: &str,
    entries: &[PlanEntry],
) -> Result<()> {
    for entry in entries {
        materialize_one(cache, layout, abi, arch, ext_api, entry).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{Platform, ResolvedArtifact, Version},
        path::{AbsDirPath, TryJoinWith},
    };

    fn artifact() -> ResolvedArtifact {
        ResolvedArtifact {
            name: "rake".into(),
            version: Version::parse("13.0.6"),
            platform: Platform::Portable,
            dependencies: vec![],
            source: Source::Index { roots: vec![url::Url::parse("https://index.example/").unwrap()] },
            needs_compilation: false,
            content_hash: None,
        }
    }

    #[tokio::test]
    async fn skip_entries_do_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Cache::new(AbsDirPath::try_from(tmp.path().join("cache")).unwrap());
        let layout = ProjectLayout::new(AbsDirPath::try_from(tmp.path().join("project")).unwrap(), "3.3");
        let abi = Abi { engine: "ruby".into(), interpreter_version: "3.3.0".into(), host_triple: "x86_64-linux".into() };
        let entry = PlanEntry { artifact: artifact(), action: PlanAction::Skip };
        materialize_one(&cache, &layout, &abi, "x86_64-linux", "3.3-x86_64-linux", &entry).await.unwrap();
    }

    #[tokio::test]
    async fn link_entry_projects_cached_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Cache::new(AbsDirPath::try_from(tmp.path().join("cache")).unwrap());
        let layout = ProjectLayout::new(AbsDirPath::try_from(tmp.path().join("project")).unwrap(), "3.3");
        let abi = Abi { engine: "ruby".into(), interpreter_version: "3.3.0".into(), host_triple: "x86_64-linux".into() };
        let art = artifact();

        let cached_dir = cache.cached(&abi, &art.full_name()).unwrap();
        fs::ensure_directory(&cached_dir).await.unwrap();
        fs::write(&cached_dir.try_join_file("lib.rb").unwrap(), b"puts 1").await.unwrap();

        let entry = PlanEntry { artifact: art.clone(), action: PlanAction::Link };
        materialize_one(&cache, &layout, &abi, "x86_64-linux", "3.3-x86_64-linux", &entry).await.unwrap();

        let gem_dir = layout.gem_dir(&art.full_name()).unwrap();
        assert!(fs::is_file(gem_dir.try_join_file("lib.rb").unwrap().as_std_path()).await);
    }
}
