//! The artifact pipeline: drives a single resolved artifact through
//! `absent -> inbound -> assembling -> assembling' -> cached`.
//!
//! Grounded on the teacher's `cas.rs` promote-by-rename pattern, generalized
//! from a single-file content-addressed store to the multi-stage directory
//! pipeline this installer needs: fetch, assemble (including VCS export),
//! compile, then an atomic promote. Promotion is the only way an entry
//! appears under `cached/`; anything left under `inbound/`/`assembling/` is
//! garbage that a sweep can remove without affecting correctness.

use std::process::Stdio;

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{instrument, trace, warn};

use crate::{
    cache::Cache,
    download::Downloader,
    error::{ArtifactFailure, InstallErrorKind},
    fs, gemspec, vcs,
    model::{Abi, Platform, ResolvedArtifact, Source},
    path::{AbsDirPath, TryJoinWith},
};

/// Everything a pipeline run needs: the shared downloader, cache root, and
/// the ABI key artifacts are being assembled for.
#[derive(Clone)]
pub struct PipelineContext {
    pub cache: Cache,
    pub downloader: Downloader,
    pub abi: Abi,
}

/// Run `artifact` through the full pipeline, promoting it into the cache on
/// success. Returns `Ok(())` once the completion marker has been written and
/// the assembling directory renamed into place.
#[instrument(skip(ctx, artifact), fields(artifact = %artifact.full_name()))]
pub async fn run_artifact(ctx: &PipelineContext, artifact: &ResolvedArtifact) -> Result<(), ArtifactFailure> {
    run_artifact_inner(ctx, artifact).await.map_err(|err| ArtifactFailure {
        identifier: artifact.full_name(),
        kind: classify(&err),
        message: format!("{err:#}"),
    })
}

async fn run_artifact_inner(ctx: &PipelineContext, artifact: &ResolvedArtifact) -> Result<()> {
    let full_name = artifact.full_name();

    if let Ok(marker) = ctx.cache.completion_marker(&ctx.abi, &full_name) {
        if fs::exists(marker.as_std_path()).await {
            trace!(%full_name, "already cached, skipping pipeline");
            return Ok(());
        }
    }

    let assembling = ctx
        .cache
        .assembling(&ctx.abi, &full_name)
        .context("compute assembling path")?;
    fs::remove_dir_all(&assembling).await.context("clear stale assembling dir")?;

    fetch_and_assemble(ctx, artifact, &assembling)
        .await
        .with_context(|| format!("assemble {full_name}"))?;

    let needs_compile = artifact.needs_compilation;
    if needs_compile {
        compile(&assembling).await.with_context(|| format!("compile {full_name}"))?;
    }

    write_completion_marker(&assembling).await.context("write completion marker")?;
    promote(ctx, &full_name, artifact, &assembling).await.context("promote into cache")?;
    Ok(())
}

async fn fetch_and_assemble(ctx: &PipelineContext, artifact: &ResolvedArtifact, assembling: &AbsDirPath) -> Result<()> {
    match &artifact.source {
        Source::Index { .. } => fetch_and_assemble_index(ctx, artifact, assembling).await,
        Source::Repository { uri, revision, submodules, .. } => {
            fetch_and_assemble_repository(ctx, artifact, uri, revision, *submodules, assembling).await
        }
        Source::Path { root, .. } => assemble_path(root, assembling).await,
    }
}

async fn fetch_and_assemble_index(ctx: &PipelineContext, artifact: &ResolvedArtifact, assembling: &AbsDirPath) -> Result<()> {
    let full_name = artifact.full_name();
    let inbound = ctx.cache.inbound_gem(&full_name).context("compute inbound gem path")?;

    if !fs::exists(inbound.as_std_path()).await {
        let url = gem_url(artifact).context("build gem download url")?;
        ctx.downloader
            .fetch(&url, &inbound, artifact.content_hash.as_ref())
            .await
            .context("download gem")?;
    } else if let Some(expected) = &artifact.content_hash {
        fs::verify_hash(&inbound, expected).await.context("verify cached inbound gem")?;
    }

    fs::ensure_directory(assembling).await.context("create assembling directory")?;
    unpack_gem(&inbound, assembling).await.context("unpack gem archive")
}

fn gem_url(artifact: &ResolvedArtifact) -> Result<url::Url> {
    let Source::Index { roots } = &artifact.source else {
        bail!("index fetch requested for a non-index source");
    };
    let root = roots.first().context("index source has no roots")?;
    let platform_suffix = match &artifact.platform {
        crate::model::Platform::Portable => String::new(),
        crate::model::Platform::Specific(p) => format!("-{p}"),
    };
    root.join(&format!("gems/{}-{}{platform_suffix}.gem", artifact.name, artifact.version))
        .context("build gem url")
}

async fn unpack_gem(gem: &crate::path::AbsFilePath, dest: &AbsDirPath) -> Result<()> {
    let gem = gem.as_std_path().to_path_buf();
    let dest = dest.as_std_path().to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::open(&gem).context("open gem file")?;
        let mut archive = tar::Archive::new(file);
        archive.unpack(&dest).context("unpack gem outer tar")?;

        let data_tar = dest.join("data.tar.gz");
        if data_tar.exists() {
            let file = std::fs::File::open(&data_tar).context("open data.tar.gz")?;
            let decoder = gzip_decoder(file)?;
            let mut archive = tar::Archive::new(decoder);
            archive.unpack(&dest).context("unpack gem data archive")?;
        }
        Ok(())
    })
    .await
    .context("join task")?
}

fn gzip_decoder(file: std::fs::File) -> Result<impl std::io::Read> {
    Ok(flate2::read::GzDecoder::new(file))
}

async fn fetch_and_assemble_repository(
    ctx: &PipelineContext,
    artifact: &ResolvedArtifact,
    uri: &url::Url,
    revision: &str,
    submodules: bool,
    assembling: &AbsDirPath,
) -> Result<()> {
    let repo = ctx.cache.inbound_repo(&artifact.source).context("compute inbound repo path")?;
    vcs::clone_or_fetch(uri, &repo).await.context("clone or fetch repository")?;
    vcs::export_revision(&repo, revision, assembling)
        .await
        .context("export revision")?;
    if submodules {
        vcs::update_submodules(&repo).await.context("update submodules")?;
    }
    Ok(())
}

async fn assemble_path(root: &AbsDirPath, assembling: &AbsDirPath) -> Result<()> {
    fs::ensure_directory(assembling).await.context("create assembling directory")?;
    fs::copy_dir(root, assembling).await.context("copy path source into assembling")?;
    Ok(())
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum BuildSystem {
    Script,
    CMake,
    TaskRunner,
}

async fn detect_build_system(dir: &AbsDirPath) -> Result<Option<BuildSystem>> {
    if let Ok(ext_glob) = find_one(dir, "extconf.rb").await {
        if ext_glob.is_some() {
            return Ok(Some(BuildSystem::Script));
        }
    }
    if find_one(dir, "CMakeLists.txt").await?.is_some() {
        return Ok(Some(BuildSystem::CMake));
    }
    if find_one(dir, "Rakefile").await?.is_some() {
        return Ok(Some(BuildSystem::TaskRunner));
    }
    Ok(None)
}

async fn find_one(dir: &AbsDirPath, name: &str) -> Result<Option<std::path::PathBuf>> {
    use futures::TryStreamExt;
    let mut files = fs::walk_files(dir);
    while let Some(file) = files.try_next().await.context("walk assembling tree")? {
        if file.as_std_path().file_name().and_then(|n| n.to_str()) == Some(name) {
            return Ok(Some(file.as_std_path().to_path_buf()));
        }
    }
    Ok(None)
}

/// Compile native extensions inside `assembling`, honouring the host CPU
/// count for build parallelism.
#[instrument]
async fn compile(assembling: &AbsDirPath) -> Result<()> {
    let Some(system) = detect_build_system(assembling).await? else {
        warn!(?assembling, "artifact marked as needing compilation but no recognised build system found");
        return Ok(());
    };

    let jobs = num_cpus::get().to_string();
    match system {
        BuildSystem::Script => {
            run(assembling, "ruby", ["extconf.rb"]).await?;
            run(assembling, "make", ["-j", &jobs]).await?;
            run(assembling, "make", ["install"]).await
        }
        BuildSystem::CMake => {
            let build_dir = assembling.try_join_dir("build").context("compute cmake build dir")?;
            fs::ensure_directory(&build_dir).await?;
            run(&build_dir, "cmake", [".."]).await?;
            run(&build_dir, "cmake", ["--build", ".", "--parallel", &jobs]).await?;
            run(&build_dir, "cmake", ["--install", "."]).await
        }
        BuildSystem::TaskRunner => run(assembling, "rake", ["compile"]).await,
    }
}

async fn run<'a>(cwd: &AbsDirPath, program: &str, args: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let args: Vec<&str> = args.into_iter().collect();
    let output = Command::new(program)
        .current_dir(cwd.as_std_path())
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("run {program} {args:?}"))?;
    if !output.status.success() {
        bail!(
            "{program} {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

async fn write_completion_marker(assembling: &AbsDirPath) -> Result<()> {
    let marker = assembling.try_join_file(".swiftgem-complete").context("compute marker path")?;
    fs::atomic_write(&marker, b"1").await
}

/// The serialized form of a cache entry's gemspec metadata: written once
/// here, read back by the materializer (projected as the project-local
/// `.spec` file the planner's warm-path check looks for) and by the planner
/// itself indirectly, through that projected file's existence.
#[derive(Serialize, Deserialize)]
struct CachedSpec {
    name: String,
    version: String,
    platform: String,
    require_paths: Vec<String>,
    executables: Vec<String>,
}

async fn promote(ctx: &PipelineContext, full_name: &str, artifact: &ResolvedArtifact, assembling: &AbsDirPath) -> Result<()> {
    let cached = ctx.cache.cached(&ctx.abi, full_name).context("compute cached path")?;
    write_cache_metadata(ctx, full_name, artifact, assembling).await.context("write cache spec/manifest")?;
    fs::atomic_move(assembling, &cached).await.context("rename assembling into cached")
}

/// Write `cached_spec`/`cached_manifest` next to (not inside) the cache
/// entry being promoted, so a warm re-run can tell this artifact is fully
/// materialized without re-walking `assembling`. Read from `assembling`
/// rather than `cached` since this runs just before the rename.
async fn write_cache_metadata(
    ctx: &PipelineContext,
    full_name: &str,
    artifact: &ResolvedArtifact,
    assembling: &AbsDirPath,
) -> Result<()> {
    let (require_paths, executables) = match gemspec::read(assembling, None).await {
        Ok(meta) => (meta.require_paths, meta.executables),
        Err(_) => (vec!["lib".to_string()], Vec::new()),
    };
    let spec = CachedSpec {
        name: artifact.name.clone(),
        version: artifact.version.to_string(),
        platform: match &artifact.platform {
            Platform::Portable => "ruby".to_string(),
            Platform::Specific(p) => p.clone(),
        },
        require_paths,
        executables,
    };
    let spec_path = ctx.cache.cached_spec(&ctx.abi, full_name).context("compute cached spec path")?;
    let spec_bytes = serde_json::to_vec_pretty(&spec).context("serialize cached spec")?;
    fs::atomic_write(&spec_path, spec_bytes).await.context("write cached spec")?;

    let mut paths = Vec::new();
    let mut files = fs::walk_files(assembling);
    while let Some(file) = files.try_next().await.context("walk assembling tree")? {
        if let Ok(rel) = file.as_std_path().strip_prefix(assembling.as_std_path()) {
            paths.push(rel.to_string_lossy().into_owned());
        }
    }
    paths.sort();
    let manifest_path = ctx.cache.cached_manifest(&ctx.abi, full_name).context("compute cached manifest path")?;
    fs::atomic_write(&manifest_path, paths.join("\n").as_bytes())
        .await
        .context("write cached manifest")
}

fn classify(err: &color_eyre::Report) -> InstallErrorKind {
    let msg = format!("{err:#}");
    if msg.contains("download") || msg.contains("GET") || msg.contains("status") {
        InstallErrorKind::Network
    } else if msg.contains("compile") || msg.contains("cmake") || msg.contains("make") || msg.contains("rake") {
        InstallErrorKind::Compilation
    } else if msg.contains("permission") || msg.contains("Permission") {
        InstallErrorKind::Permission
    } else {
        InstallErrorKind::Install
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detects_no_build_system_in_empty_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = AbsDirPath::try_from(tmp.path().to_path_buf()).unwrap();
        assert_eq!(detect_build_system(&dir).await.unwrap(), None);
    }

    #[tokio::test]
    async fn detects_cmake_build_system() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("CMakeLists.txt"), "project(x)").unwrap();
        let dir = AbsDirPath::try_from(tmp.path().to_path_buf()).unwrap();
        assert_eq!(detect_build_system(&dir).await.unwrap(), Some(BuildSystem::CMake));
    }

    fn artifact() -> ResolvedArtifact {
        ResolvedArtifact {
            name: "rake".into(),
            version: crate::model::Version::parse("13.0.6"),
            platform: Platform::Portable,
            dependencies: vec![],
            source: Source::Index { roots: vec![url::Url::parse("https://index.example/").unwrap()] },
            needs_compilation: false,
            content_hash: None,
        }
    }

    fn ctx(cache_root: std::path::PathBuf) -> PipelineContext {
        PipelineContext {
            cache: Cache::new(AbsDirPath::try_from(cache_root).unwrap()),
            downloader: Downloader::new(crate::download::DEFAULT_PER_HOST_CONCURRENCY).unwrap(),
            abi: Abi { engine: "ruby".into(), interpreter_version: "3.3.0".into(), host_triple: "x86_64-linux".into() },
        }
    }

    #[tokio::test]
    async fn promote_writes_cached_spec_and_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(tmp.path().join("cache"));
        let art = artifact();
        let full_name = art.full_name();

        let assembling = ctx.cache.assembling(&ctx.abi, &full_name).unwrap();
        fs::ensure_directory(&assembling).await.unwrap();
        fs::write(&assembling.try_join_file("lib.rb").unwrap(), b"puts 1").await.unwrap();

        promote(&ctx, &full_name, &art, &assembling).await.unwrap();

        let spec_path = ctx.cache.cached_spec(&ctx.abi, &full_name).unwrap();
        assert!(fs::is_file(spec_path.as_std_path()).await);
        let spec_bytes = fs::must_read_buffered(&spec_path).await.unwrap();
        let spec: CachedSpec = serde_json::from_slice(&spec_bytes).unwrap();
        assert_eq!(spec.name, "rake");
        assert_eq!(spec.require_paths, vec!["lib".to_string()]);

        let manifest_path = ctx.cache.cached_manifest(&ctx.abi, &full_name).unwrap();
        let manifest = fs::must_read_buffered_utf8(&manifest_path).await.unwrap();
        assert!(manifest.contains("lib.rb"));

        let cached_dir = ctx.cache.cached(&ctx.abi, &full_name).unwrap();
        assert!(fs::is_dir(cached_dir.as_std_path()).await);
    }
}
