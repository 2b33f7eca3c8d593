//! The binary entrypoint for `swiftgem`, a high-throughput dependency
//! installer for the gem packaging ecosystem.

use std::path::PathBuf;

use clap::{Parser, Subcommand, crate_version};
use color_eyre::{Result, eyre::Context};
use tracing::instrument;
use tracing_subscriber::util::SubscriberInitExt;

// Since this is a binary crate, we need to ensure these modules aren't pub
// so that they can correctly warn about dead code:
// https://github.com/rust-lang/rust/issues/74970
//
// Relatedly, in this file specifically nothing should be `pub`.
mod cmd;
mod log;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "swiftgem",
    about = "A high-throughput installer for gem-based dependency manifests",
    version = crate_version!(),
)]
struct TopLevelFlags {
    #[command(subcommand)]
    command: Command,

    /// Emit flamegraph profiling data
    #[arg(short, long, hide(true))]
    profile: Option<PathBuf>,

    /// When to colorize output
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Resolve the manifest and install its dependencies (the default
    /// command when none is given)
    Install(cmd::install::Options),

    /// Run a command with the project's dependencies on its load path
    Exec(cmd::exec::Options),

    /// Manage the global artifact cache
    #[clap(subcommand)]
    Cache(cmd::cache::Command),

    /// Print the installed version
    Version,
}

#[instrument]
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let top = TopLevelFlags::parse();

    let (logger, flame_guard) = log::make_logger(std::io::stderr, top.profile.clone(), top.color)?;
    logger.init();

    let exit_code = match top.command {
        Command::Install(opts) => cmd::install::exec(opts).await?,
        Command::Exec(opts) => match cmd::exec::exec(opts).await {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("error: {err:#}");
                1
            }
        },
        Command::Cache(cmd) => match cmd::cache::exec(cmd).await {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("error: {err:#}");
                1
            }
        },
        Command::Version => match cmd::version::exec().await {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("error: {err:#}");
                1
            }
        },
    };

    if let Some(flame_guard) = flame_guard {
        flame_guard.flush().context("flush flame_guard")?;
    }

    std::process::exit(exit_code);
}
