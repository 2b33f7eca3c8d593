//! The `install` command: the main orchestrator tying every library
//! component together into one run — manifest, resolver, planner,
//! scheduler-driven pipeline, materializer, lockfile, and runtime map.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use clap::Args;
use color_eyre::{
    Result,
    eyre::{Context as _, Report, bail},
};
use swiftgem::{
    abi,
    cache::Cache,
    config::Config,
    download::{DEFAULT_PER_HOST_CONCURRENCY, Downloader},
    error::{self, ArtifactFailure, InstallErrorKind},
    fs, gemspec,
    index::IndexClient,
    lockfile,
    manifest,
    materialize,
    model::{DependencyRequest, PlanAction, Platform, ResolvedArtifact, Source, Version},
    observer::{NullObserver, SchedulerObserver},
    path::{AbsDirPath, AbsFilePath},
    pipeline::{self, PipelineContext},
    planner::{self, ProjectLayout},
    progress::TerminalObserver,
    resolver::{self, ResolverAdapter},
    runtime_map::RuntimeMap,
    scheduler::{self, Scheduler},
    vcs,
};
use tracing::{instrument, warn};

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Project-local install directory override.
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// Manifest file to read, relative to the current directory.
    #[arg(long, default_value = "Gemfile")]
    pub manifest: PathBuf,

    /// Worker count override (defaults to the scheduler's own heuristic).
    #[arg(short = 'j', long)]
    pub jobs: Option<usize>,

    /// Abort the entire run as soon as any artifact fails.
    #[arg(long)]
    pub fail_fast: bool,

    /// Render per-artifact progress bars.
    #[arg(short, long)]
    pub verbose: bool,
}

type StageResult<T> = std::result::Result<T, (InstallErrorKind, Report)>;

/// The orderly-shutdown exit code for an operator interrupt (`SIGINT`),
/// matching the conventional `128 + SIGINT` POSIX convention shells use.
const EXIT_INTERRUPTED: i32 = 130;

#[instrument(skip(options))]
pub async fn exec(options: Options) -> Result<i32> {
    match run(options).await {
        Ok((failures, interrupted)) => {
            for failure in &failures {
                eprintln!("error: {failure}");
            }
            if interrupted {
                Ok(EXIT_INTERRUPTED)
            } else {
                Ok(error::worst_exit_code(&failures))
            }
        }
        Err((kind, err)) => {
            eprintln!("error: {err:#}");
            Ok(kind.exit_code())
        }
    }
}

async fn run(options: Options) -> StageResult<(Vec<ArtifactFailure>, bool)> {
    let cwd = std::env::current_dir().map_err(|err| (InstallErrorKind::Platform, Report::new(err)))?;

    let project_root_override = match &options.path {
        Some(path) => Some(AbsDirPath::try_from(cwd.join(path)).map_err(|err| (InstallErrorKind::Manifest, err))?),
        None => None,
    };
    let config = Config::load(None, project_root_override, options.jobs, options.fail_fast, options.verbose)
        .await
        .map_err(|err| (InstallErrorKind::Cache, err))?;

    let manifest_path =
        AbsFilePath::try_from(cwd.join(&options.manifest)).map_err(|err| (InstallErrorKind::Manifest, err))?;
    let contents = fs::must_read_buffered_utf8(&manifest_path)
        .await
        .map_err(|err| (InstallErrorKind::Manifest, err))?;
    let parsed_manifest =
        manifest::parse(&contents, &config.project_root).map_err(|err| (InstallErrorKind::Manifest, err))?;

    let ruby_version = parsed_manifest
        .ruby_version
        .clone()
        .unwrap_or_else(|| abi::DEFAULT_INTERPRETER_VERSION.to_string());
    let abi = abi::current(&ruby_version);
    let arch = abi.host_triple.clone();
    let ext_api = format!("{ruby_version}-{arch}");

    let primary_root = parsed_manifest
        .sources
        .first()
        .cloned()
        .unwrap_or_else(|| url::Url::parse("https://rubygems.org/").expect("static url parses"));
    let index_source = Source::Index { roots: vec![primary_root] };

    let cache = Cache::new(config.cache_root.clone());
    let http = reqwest::Client::new();
    let downloader =
        Downloader::new(DEFAULT_PER_HOST_CONCURRENCY).map_err(|err| (InstallErrorKind::Network, err))?;
    let index_client =
        IndexClient::new(http, cache.clone(), index_source.clone()).map_err(|err| (InstallErrorKind::Network, err))?;

    let lockfile_path = AbsFilePath::try_from(cwd.join("Gemfile.lock")).map_err(|err| (InstallErrorKind::Lockfile, err))?;
    let locked = match fs::read_buffered_utf8(&lockfile_path).await.map_err(|err| (InstallErrorKind::Lockfile, err))? {
        Some(text) => locked_versions(&lockfile::parse(&text).map_err(|err| (InstallErrorKind::Lockfile, err))?),
        None => BTreeMap::new(),
    };

    let adapter = ResolverAdapter::new(index_client, config.clone(), abi.clone(), locked);

    let (indexed_requests, pinned_requests): (Vec<DependencyRequest>, Vec<DependencyRequest>) =
        parsed_manifest.dependencies.into_iter().partition(|dep| dep.source.is_none());
    let top_level: Vec<String> = indexed_requests
        .iter()
        .chain(pinned_requests.iter())
        .map(|dep| dep.name.clone())
        .collect();

    let mut resolved = resolver::resolve(&adapter, &indexed_requests, &index_source)
        .await
        .map_err(|err| (InstallErrorKind::Resolution, err))?;

    for request in &pinned_requests {
        let artifact = resolve_pinned(&cache, request)
            .await
            .map_err(|err| (InstallErrorKind::Resolution, err))?;
        resolved.push(artifact);
    }

    let layout = ProjectLayout::new(config.project_root.clone(), minor_version(&ruby_version));
    let plan = planner::plan(&cache, &layout, &abi, &arch, &ext_api, &resolved)
        .await
        .map_err(|err| (InstallErrorKind::Install, err))?;

    let observer: Arc<dyn SchedulerObserver> = if options.verbose {
        Arc::new(TerminalObserver::new())
    } else {
        Arc::new(NullObserver)
    };
    let sched = Scheduler::new(observer, options.fail_fast);
    sched.start(options.jobs.unwrap_or_else(scheduler::hard_cap));

    let interrupt_flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupt_flag))
        .map_err(|err| (InstallErrorKind::Platform, Report::new(err)))?;
    let watcher = {
        let sched = sched.clone();
        let interrupt_flag = Arc::clone(&interrupt_flag);
        tokio::spawn(async move {
            loop {
                if interrupt_flag.load(Ordering::SeqCst) {
                    warn!("received interrupt, draining in-flight work and shutting down");
                    sched.interrupt();
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        })
    };

    let ctx = PipelineContext { cache: cache.clone(), downloader, abi: abi.clone() };
    for entry in plan.iter().filter(|entry| entry.action != PlanAction::Skip) {
        let artifact = entry.artifact.clone();
        let ctx = ctx.clone();
        sched.enqueue("install", &artifact.full_name(), async move {
            pipeline::run_artifact(&ctx, &artifact).await
        });
    }
    sched.wait_for("install").await;
    sched.shutdown().await;
    watcher.abort();

    let interrupted = sched.interrupted();
    let failures = sched.errors();
    if interrupted || (!failures.is_empty() && options.fail_fast) {
        return Ok((failures, interrupted));
    }

    materialize::materialize_all(&cache, &layout, &abi, &arch, &ext_api, &plan)
        .await
        .map_err(|err| (InstallErrorKind::Install, err))?;

    let lock = lockfile::from_resolved(&resolved, &top_level, Some(format!("ruby {ruby_version}")), None);
    lockfile::write(&lockfile_path, &lock)
        .await
        .map_err(|err| (InstallErrorKind::Lockfile, err))?;

    write_runtime_map(&layout, &resolved)
        .await
        .map_err(|err| (InstallErrorKind::Install, err))?;

    Ok((failures, interrupted))
}

fn locked_versions(lock: &lockfile::LockFile) -> BTreeMap<String, Version> {
    lock.gem
        .iter()
        .chain(lock.git.iter())
        .chain(lock.path.iter())
        .flat_map(|section| &section.specs)
        .map(|spec| (spec.name.clone(), Version::parse(spec.version.clone())))
        .collect()
}

fn minor_version(ruby_version: &str) -> String {
    let mut parts = ruby_version.splitn(3, '.');
    match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) => format!("{major}.{minor}"),
        _ => ruby_version.to_string(),
    }
}

/// Resolve a single pinned (`git:`/`path:`) dependency request directly,
/// bypassing the index solver entirely: its version comes from its own
/// gemspec rather than a compact-index `versions` record.
///
/// TODO: runtime dependencies declared by a pinned gemspec are not yet fed
/// back into the solver, so a git/path gem's own deps must currently also be
/// declared directly in the manifest.
async fn resolve_pinned(cache: &Cache, request: &DependencyRequest) -> Result<ResolvedArtifact> {
    let source = request.source.clone().context("pinned dependency request missing a source")?;
    match source {
        Source::Path { root, glob } => {
            let meta = gemspec::read(&root, glob.as_deref()).await.context("read path gemspec")?;
            Ok(ResolvedArtifact {
                name: meta.name,
                version: meta.version,
                platform: Platform::Portable,
                dependencies: Vec::new(),
                source: Source::Path { root, glob },
                needs_compilation: false,
                content_hash: None,
            })
        }
        Source::Repository { uri, branch, tag, revision, submodules, glob } => {
            let repo_source = Source::Repository {
                uri: uri.clone(),
                branch: branch.clone(),
                tag: tag.clone(),
                revision: revision.clone(),
                submodules,
                glob: glob.clone(),
            };
            let repo = cache.inbound_repo(&repo_source).context("compute inbound repo path")?;
            vcs::clone_or_fetch(&uri, &repo).await.context("clone pinned git dependency")?;

            let resolved_revision = if revision.is_empty() {
                let refname = tag.clone().or_else(|| branch.clone()).unwrap_or_else(|| "HEAD".to_string());
                vcs::resolve_revision(&repo, &refname).await.context("resolve git ref to a revision")?
            } else {
                revision
            };

            let scratch = fs::scoped_tempdir("pinned-gemspec").await.context("create scratch dir for gemspec read")?;
            vcs::export_revision(&repo, &resolved_revision, scratch.path())
                .await
                .context("export pinned revision")?;
            let meta = gemspec::read(scratch.path(), glob.as_deref()).await.context("read git gemspec")?;

            Ok(ResolvedArtifact {
                name: meta.name,
                version: meta.version,
                platform: Platform::Portable,
                dependencies: Vec::new(),
                source: Source::Repository { uri, branch, tag, revision: resolved_revision, submodules, glob },
                needs_compilation: false,
                content_hash: None,
            })
        }
        Source::Index { .. } => bail!("index source reached the pinned-dependency resolution path"),
    }
}

async fn write_runtime_map(layout: &ProjectLayout, resolved: &[ResolvedArtifact]) -> Result<()> {
    let mut map = RuntimeMap::default();
    for artifact in resolved {
        let load_paths = match &artifact.source {
            Source::Path { root, .. } => vec![root.as_std_path().join("lib").to_string_lossy().into_owned()],
            _ => {
                let gem_dir = layout.gem_dir(&artifact.full_name()).context("compute project gem dir")?;
                vec![gem_dir.as_std_path().join("lib").to_string_lossy().into_owned()]
            }
        };
        map.insert(&artifact.name, artifact.version.as_str(), load_paths);
    }
    let path = layout.runtime_map_path().context("compute runtime map path")?;
    swiftgem::runtime_map::write(&path, &map).await.context("write runtime map")
}

#[cfg(test)]
mod tests {
    use swiftgem::path::TryJoinWith as _;

    use super::*;

    #[test]
    fn minor_version_drops_the_patch_component() {
        assert_eq!(minor_version("3.3.0"), "3.3");
        assert_eq!(minor_version("3.2.9"), "3.2");
        assert_eq!(minor_version("garbage"), "garbage");
    }

    #[test]
    fn locked_versions_collects_the_gem_section() {
        let text = r#"GEM
  remote: https://rubygems.org/
  specs:
    rake (13.0.6)
    thor (1.2.1)

PLATFORMS
  ruby

DEPENDENCIES
  rake
"#;
        let lock = lockfile::parse(text).unwrap();
        let versions = locked_versions(&lock);
        assert_eq!(versions.get("rake").unwrap().as_str(), "13.0.6");
        assert_eq!(versions.get("thor").unwrap().as_str(), "1.2.1");
    }

    #[tokio::test]
    async fn resolve_pinned_reads_name_and_version_from_a_path_gemspec() {
        let tmp = tempfile::tempdir().unwrap();
        let root = AbsDirPath::try_from(tmp.path().to_path_buf()).unwrap();
        fs::atomic_write(
            &root.try_join_file("local_gem.gemspec").unwrap(),
            br#"Gem::Specification.new do |s|
  s.name = "local_gem"
  s.version = "0.1.0"
end
"#,
        )
        .await
        .unwrap();

        let cache = Cache::new(AbsDirPath::try_from(tmp.path().join("cache")).unwrap());
        let request = DependencyRequest {
            name: "local_gem".to_string(),
            constraints: Vec::new(),
            groups: Vec::new(),
            platforms: Vec::new(),
            source: Some(Source::Path { root: root.clone(), glob: None }),
        };

        let artifact = resolve_pinned(&cache, &request).await.unwrap();
        assert_eq!(artifact.name, "local_gem");
        assert_eq!(artifact.version.as_str(), "0.1.0");
        assert!(!artifact.needs_compilation);
    }
}
