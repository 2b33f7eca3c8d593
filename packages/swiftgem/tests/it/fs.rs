use std::collections::BTreeMap;

use color_eyre::{Result, eyre::Context};
use futures::{StreamExt, TryStreamExt};
use swiftgem::{
    fs::{self, Metadata},
    path::{AbsDirPath, RelFilePath, RelativeTo, TryJoinWith as _},
};
use pretty_assertions::assert_eq;

use crate::temporary_directory;

#[test_log::test(tokio::test)]
async fn copy_dir_reproduces_file_tree() -> Result<()> {
    let (_st, src) = temporary_directory();
    let (_dt, dst) = temporary_directory();

    fs::ensure_directory(&src.try_join_dir("nested")?).await?;
    fs::atomic_write(&src.try_join_file("top.txt")?, b"top level").await?;
    fs::atomic_write(&src.try_join_combined(["nested"], "leaf.txt")?, b"nested leaf").await?;

    fs::copy_dir(&src, &dst)
        .await
        .with_context(|| format!("copy {src:?} to {dst:?} natively"))?;
    let (source, destination) = tokio::try_join!(
        DirectoryMetadata::from_directory(&src),
        DirectoryMetadata::from_directory(&dst)
    )
    .with_context(|| format!("diff {src:?} and {dst:?}"))?;
    assert_eq!(source, destination, "directories should be equivalent");

    Ok(())
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
struct DirectoryMetadata(BTreeMap<RelFilePath, Metadata>);

impl DirectoryMetadata {
    async fn from_directory(root: &AbsDirPath) -> Result<DirectoryMetadata> {
        fs::walk_files(root)
            .map(|entry| async move {
                let entry = entry.context("walk directory")?;
                let metadata = Metadata::from_file(&entry).await.context("get metadata")?;
                let path = entry.relative_to(root).context("make relative")?;
                Ok((path, metadata))
            })
            .buffer_unordered(fs::DEFAULT_CONCURRENCY)
            .try_filter_map(|(path, meta)| async move {
                match meta {
                    Some(meta) => Ok(Some((path, meta))),
                    None => Ok(None),
                }
            })
            .try_collect::<BTreeMap<_, _>>()
            .await
            .map(Self)
    }
}
