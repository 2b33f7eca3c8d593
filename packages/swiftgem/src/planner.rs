//! The planner: diffs a resolved set against the project-local directory
//! and the global cache, emitting exactly one [`PlanEntry`] per artifact.
//!
//! Grounded in the cache's path algebra (`cache::Cache`) plus the
//! project-local layout §6 describes; the decision tree below is a direct
//! transcription of that layout diff, ordered so the cheapest check (is it
//! already materialized?) runs first.

use color_eyre::Result;
use tracing::instrument;

use crate::{
    cache::Cache,
    fs,
    model::{Abi, PlanAction, PlanEntry, Platform, ResolvedArtifact},
    path::{AbsDirPath, TryJoinWith},
};

/// The project-local directory layout the materializer projects into and
/// the planner checks against.
pub struct ProjectLayout {
    root: AbsDirPath,
    minor: String,
}

impl ProjectLayout {
    pub fn new(root: AbsDirPath, minor: impl Into<String>) -> Self {
        Self { root, minor: minor.into() }
    }

    pub fn gem_dir(&self, full_name: &str) -> Result<AbsDirPath> {
        self.root
            .try_join_dirs([format!("{}.0", self.minor), "gems".to_string(), full_name.to_string()])
    }

    pub fn spec_file(&self, full_name: &str) -> Result<crate::path::AbsFilePath> {
        self.root.try_join_combined(
            [format!("{}.0", self.minor), "specifications".to_string()],
            format!("{full_name}.spec"),
        )
    }

    pub fn extension_dir(&self, arch: &str, ext_api: &str, full_name: &str) -> Result<AbsDirPath> {
        self.root.try_join_dirs([
            format!("{}.0", self.minor),
            "extensions".to_string(),
            arch.to_string(),
            ext_api.to_string(),
            full_name.to_string(),
        ])
    }

    /// `<root>/runtime_map.json`, read by `swiftgem exec` to build `RUBYLIB`.
    pub fn runtime_map_path(&self) -> Result<crate::path::AbsFilePath> {
        self.root.try_join_file("runtime_map.json")
    }
}

/// Decide the action for one artifact. See §4.7 for the exact decision
/// tree; this function implements it literally.
#[instrument(skip(cache, layout), fields(artifact = %artifact.full_name()))]
pub async fn plan_one(
    cache: &Cache,
    layout: &ProjectLayout,
    abi: &Abi,
    arch: &str,
    ext_api: &str,
    artifact: &ResolvedArtifact,
) -> Result<PlanEntry> {
    let full_name = artifact.full_name();

    let gem_dir = layout.gem_dir(&full_name)?;
    let spec_file = layout.spec_file(&full_name)?;
    let materialized = fs::is_dir(gem_dir.as_std_path()).await && fs::is_file(spec_file.as_std_path()).await;

    if materialized {
        let native_ready = if artifact.needs_compilation {
            let ext_dir = layout.extension_dir(arch, ext_api, &full_name)?;
            fs::is_dir(ext_dir.as_std_path()).await
        } else {
            true
        };
        if native_ready {
            return Ok(PlanEntry { artifact: artifact.clone(), action: PlanAction::Skip });
        }
    }

    let cached = cache.cached(abi, &full_name)?;
    let marker = cache.completion_marker(abi, &full_name)?;
    if fs::exists(marker.as_std_path()).await {
        let action = if artifact.needs_compilation && !fs::is_dir(cached.as_std_path()).await {
            PlanAction::BuildExt
        } else {
            PlanAction::Link
        };
        return Ok(PlanEntry { artifact: artifact.clone(), action });
    }

    let assembling = cache.assembling(abi, &full_name)?;
    if fs::is_dir(assembling.as_std_path()).await && !fs::is_dir_empty(&assembling).await.unwrap_or(false) {
        return Ok(PlanEntry { artifact: artifact.clone(), action: PlanAction::BuildExt });
    }

    Ok(PlanEntry { artifact: artifact.clone(), action: PlanAction::Download })
}

/// Plan an entire resolved set. Download entries are moved to the front,
/// sorted by a size estimate (largest first); the remaining entries keep
/// their resolved order. The sort is stable.
#[instrument(skip(cache, layout, artifacts))]
pub async fn plan(
    cache: &Cache,
    layout: &ProjectLayout,
    abi: &Abi,
    arch: &str,
    ext_api: &str,
    artifacts: &[ResolvedArtifact],
) -> Result<Vec<PlanEntry>> {
    let mut entries = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        entries.push(plan_one(cache, layout, abi, arch, ext_api, artifact).await?);
    }

    let mut downloads: Vec<PlanEntry> = entries
        .iter()
        .filter(|e| e.action == PlanAction::Download)
        .cloned()
        .collect();
    downloads.sort_by(|a, b| size_estimate(b).cmp(&size_estimate(a)));

    let rest: Vec<PlanEntry> = entries.into_iter().filter(|e| e.action != PlanAction::Download).collect();
    downloads.extend(rest);
    Ok(downloads)
}

/// A crude size estimate used only to order downloads so the pipeline
/// saturates early on the biggest transfers. Native-compiled artifacts are
/// assumed larger than portable ones absent better data.
fn size_estimate(entry: &PlanEntry) -> u64 {
    let mut estimate = entry.artifact.dependencies.len() as u64 * 1024;
    if entry.artifact.needs_compilation {
        estimate += 10 * 1024 * 1024;
    }
    if matches!(entry.artifact.platform, Platform::Specific(_)) {
        estimate += 1024 * 1024;
    }
    estimate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;

    fn artifact(name: &str, needs_compilation: bool) -> ResolvedArtifact {
        ResolvedArtifact {
            name: name.to_string(),
            version: crate::model::Version::parse("1.0.0"),
            platform: Platform::Portable,
            dependencies: vec![],
            source: Source::Index { roots: vec![url::Url::parse("https://index.example/").unwrap()] },
            needs_compilation,
            content_hash: None,
        }
    }

    #[tokio::test]
    async fn absent_artifact_plans_to_download() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Cache::new(AbsDirPath::try_from(tmp.path().join("cache")).unwrap());
        let layout = ProjectLayout::new(AbsDirPath::try_from(tmp.path().join("project")).unwrap(), "3.3");
        let abi = Abi { engine: "ruby".into(), interpreter_version: "3.3.0".into(), host_triple: "x86_64-linux".into() };

        let entry = plan_one(&cache, &layout, &abi, "x86_64-linux", "3.3-x86_64-linux", &artifact("rake", false))
            .await
            .unwrap();
        assert_eq!(entry.action, PlanAction::Download);
    }

    #[tokio::test]
    async fn cached_with_marker_plans_to_link() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Cache::new(AbsDirPath::try_from(tmp.path().join("cache")).unwrap());
        let layout = ProjectLayout::new(AbsDirPath::try_from(tmp.path().join("project")).unwrap(), "3.3");
        let abi = Abi { engine: "ruby".into(), interpreter_version: "3.3.0".into(), host_triple: "x86_64-linux".into() };
        let art = artifact("rake", false);

        let cached_dir = cache.cached(&abi, &art.full_name()).unwrap();
        fs::ensure_directory(&cached_dir).await.unwrap();
        let marker = cache.completion_marker(&abi, &art.full_name()).unwrap();
        fs::atomic_write(&marker, b"1").await.unwrap();

        let entry = plan_one(&cache, &layout, &abi, "x86_64-linux", "3.3-x86_64-linux", &art).await.unwrap();
        assert_eq!(entry.action, PlanAction::Link);
    }

    #[test]
    fn downloads_sort_largest_first() {
        let small = PlanEntry { artifact: artifact("a", false), action: PlanAction::Download };
        let big = PlanEntry { artifact: artifact("b", true), action: PlanAction::Download };
        assert!(size_estimate(&big) > size_estimate(&small));
    }
}
