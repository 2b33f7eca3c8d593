use std::path::PathBuf;

use clap::Args;
use color_eyre::{Result, eyre::Context as _};
use swiftgem::{path::AbsFilePath, runtime_map};
use tokio::process::Command;
use tracing::instrument;

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Project-local directory override.
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// The command to run, with arguments.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

/// Run a command with load paths from the project-local runtime map
/// injected into its environment, the way the runtime launcher (external)
/// would at process-spawn time.
#[instrument]
pub async fn exec(options: Options) -> Result<()> {
    let project_root = options.path.unwrap_or_else(|| PathBuf::from("./vendor/swiftgem"));
    let map_path = AbsFilePath::try_from(project_root.join("runtime_map.json")).context("build runtime map path")?;
    let load_paths = match runtime_map::read(&map_path).await.context("read runtime map")? {
        Some(map) => map.0.values().flat_map(|e| e.load_paths.clone()).collect::<Vec<_>>().join(":"),
        None => String::new(),
    };

    let Some((program, args)) = options.command.split_first() else {
        color_eyre::eyre::bail!("no command given");
    };

    let mut cmd = Command::new(program);
    cmd.args(args);
    if !load_paths.is_empty() {
        cmd.env("RUBYLIB", load_paths);
    }

    let status = cmd.status().await.with_context(|| format!("run {program}"))?;
    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}
