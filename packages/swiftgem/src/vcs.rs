//! Version control collaborator: clones/fetches repository sources and
//! exports a clean working tree (no `.git` internals) for the pipeline to
//! compile from.
//!
//! Shells out to the system `git` binary using the same process-invocation
//! idiom the teacher workspace uses for external tool invocation
//! (`tokio::process::Command` wrapped with `color_eyre` context), since no
//! in-process git implementation is part of this workspace's dependency
//! stack.

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use tokio::process::Command;
use tracing::{instrument, trace};

use crate::{fs, path::AbsDirPath};

/// Clone (if absent) or fetch (if present) the repository at `uri` into
/// `dest`, a bare-ish working clone used as the long-lived VCS cache entry
/// for this source.
#[instrument]
pub async fn clone_or_fetch(uri: &url::Url, dest: &AbsDirPath) -> Result<()> {
    if fs::is_dir(dest.as_std_path()).await {
        trace!(%uri, ?dest, "fetching existing clone");
        run_git(dest, ["fetch", "--all", "--tags"]).await
    } else {
        trace!(%uri, ?dest, "cloning repository");
        if let Some(parent) = dest.parent() {
            fs::ensure_directory(&parent).await?;
        }
        run_git_in(
            dest.parent().context("destination has no parent")?.as_std_path(),
            [
                "clone",
                "--no-checkout",
                uri.as_str(),
                dest.as_std_path().to_str().context("non-utf8 path")?,
            ],
        )
        .await
    }
}

/// Check out `revision` in the clone at `repo`, then export a clean working
/// tree (no `.git` directory) into `dest`.
#[instrument]
pub async fn export_revision(repo: &AbsDirPath, revision: &str, dest: &AbsDirPath) -> Result<()> {
    run_git(repo, ["checkout", "--force", revision]).await?;
    fs::ensure_directory(dest).await?;

    let archive_output = Command::new("git")
        .arg("-C")
        .arg(repo.as_std_path())
        .arg("archive")
        .arg(revision)
        .output()
        .await
        .context("run git archive")?;
    if !archive_output.status.success() {
        bail!(
            "git archive failed: {}",
            String::from_utf8_lossy(&archive_output.stderr)
        );
    }

    extract_tar(&archive_output.stdout, dest).await
}

/// Update submodules in-place within `repo`, for sources that opt in.
#[instrument]
pub async fn update_submodules(repo: &AbsDirPath) -> Result<()> {
    run_git(repo, ["submodule", "update", "--init", "--recursive"]).await
}

/// Resolve `refname` (a branch, tag, or `HEAD`) to a concrete commit SHA
/// within `repo`. Used when a manifest dependency names a branch or tag but
/// not an explicit `ref:`, so the lockfile can still pin an immutable
/// revision.
#[instrument]
pub async fn resolve_revision(repo: &AbsDirPath, refname: &str) -> Result<String> {
    let output = Command::new("git")
        .current_dir(repo.as_std_path())
        .args(["rev-parse", refname])
        .output()
        .await
        .with_context(|| format!("run git rev-parse {refname}"))?;
    if !output.status.success() {
        bail!(
            "git rev-parse {refname} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8(output.stdout).context("rev-parse output is not utf8")?.trim().to_string())
}

async fn extract_tar(bytes: &[u8], dest: &AbsDirPath) -> Result<()> {
    let dest = dest.as_std_path().to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut archive = tar::Archive::new(std::io::Cursor::new(bytes));
        archive.unpack(&dest).context("unpack git archive")
    })
    .await
    .context("join task")?
}

async fn run_git<'a>(repo: &AbsDirPath, args: impl IntoIterator<Item = &'a str>) -> Result<()> {
    run_git_in(repo.as_std_path(), args).await
}

async fn run_git_in<'a>(cwd: &std::path::Path, args: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let args: Vec<&str> = args.into_iter().collect();
    let output = Command::new("git")
        .current_dir(cwd)
        .args(&args)
        .output()
        .await
        .with_context(|| format!("run git {args:?}"))?;
    if !output.status.success() {
        bail!(
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::TryJoinWith as _;

    async fn init_repo_with_commit(dir: &AbsDirPath) -> String {
        run_git(dir, ["init", "--initial-branch=main"]).await.unwrap();
        run_git(dir, ["config", "user.email", "test@example.com"]).await.unwrap();
        run_git(dir, ["config", "user.name", "test"]).await.unwrap();
        fs::atomic_write(&dir.try_join_file("gem.gemspec").unwrap(), b"Gem::Specification.new").await.unwrap();
        run_git(dir, ["add", "."]).await.unwrap();
        run_git(dir, ["commit", "-m", "initial"]).await.unwrap();
        run_git(dir, ["tag", "v1.0.0"]).await.unwrap();
        let output = Command::new("git")
            .current_dir(dir.as_std_path())
            .args(["rev-parse", "HEAD"])
            .output()
            .await
            .unwrap();
        String::from_utf8(output.stdout).unwrap().trim().to_string()
    }

    #[tokio::test]
    async fn resolve_revision_pins_a_tag_to_its_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = AbsDirPath::try_from(tmp.path().to_path_buf()).unwrap();
        let head = init_repo_with_commit(&repo).await;

        let resolved = resolve_revision(&repo, "v1.0.0").await.unwrap();
        assert_eq!(resolved, head);
    }

    #[tokio::test]
    async fn resolve_revision_resolves_head() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = AbsDirPath::try_from(tmp.path().to_path_buf()).unwrap();
        let head = init_repo_with_commit(&repo).await;

        let resolved = resolve_revision(&repo, "HEAD").await.unwrap();
        assert_eq!(resolved, head);
    }

    #[tokio::test]
    async fn export_revision_writes_a_clean_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = AbsDirPath::try_from(tmp.path().join("repo")).unwrap();
        fs::ensure_directory(&repo).await.unwrap();
        init_repo_with_commit(&repo).await;

        let dest = AbsDirPath::try_from(tmp.path().join("export")).unwrap();
        export_revision(&repo, "v1.0.0", &dest).await.unwrap();
        assert!(fs::is_file(dest.try_join_file("gem.gemspec").unwrap().as_std_path()).await);
        assert!(!fs::is_dir(dest.try_join_dir(".git").unwrap().as_std_path()).await);
    }
}
