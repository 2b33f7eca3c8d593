use clap::Subcommand;
use color_eyre::{Result, eyre::Context as _};
use swiftgem::{
    fs::{self, user_global_cache_path},
    path::TryJoinWith as _,
};

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// List entries under the global cache root.
    List,

    /// Remove the entire global cache.
    Clear {
        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Print the global cache root's path.
    Dir,
}

pub async fn exec(cmd: Command) -> Result<()> {
    match cmd {
        Command::List => list().await,
        Command::Clear { yes } => clear(yes).await,
        Command::Dir => dir().await,
    }
}

async fn dir() -> Result<()> {
    let path = user_global_cache_path().await.context("get cache path")?;
    println!("{path}");
    Ok(())
}

async fn list() -> Result<()> {
    let root = user_global_cache_path().await.context("get cache path")?;
    for stage in ["inbound", "assembling", "cached", "index"] {
        let Ok(dir) = root.try_join_dir(stage) else { continue };
        if !fs::is_dir(dir.as_std_path()).await {
            continue;
        }
        println!("{stage}:");
        let mut entries = fs::read_dir(&dir).await.context("read cache stage dir")?;
        while let Some(entry) = entries.next_entry().await.context("read entry")? {
            println!("  {}", entry.file_name().to_string_lossy());
        }
    }
    Ok(())
}

async fn clear(yes: bool) -> Result<()> {
    let root = user_global_cache_path().await.context("get cache path")?;
    if !yes {
        let confirmed = inquire::Confirm::new(&format!("Delete the entire cache at {root}?"))
            .with_default(false)
            .prompt()
            .context("prompt for confirmation")?;
        if !confirmed {
            return Ok(());
        }
    }
    fs::remove_dir_all(&root).await.context("remove cache root")?;
    println!("Cache cleared.");
    Ok(())
}
