//! Pure path algebra over the global cache root.
//!
//! Every function here is a deterministic mapping from an artifact identifier
//! (or source) to a path under the cache root; none of them touch the
//! filesystem. Grounded on the wrapper-type style of `uv-cache`'s
//! `CacheEntry`/`CacheShard`, adapted to name the exact directories this
//! installer's pipeline promotes into.

use crate::{
    model::{Abi, ResolvedArtifact, Source},
    path::{AbsDirPath, AbsFilePath, RelDirPath, RelFilePath, TryJoinWith},
};

/// The cache root, plus the derived path algebra used by every other
/// component that needs to address a cache-relative location.
#[derive(Clone, Debug)]
pub struct Cache {
    root: AbsDirPath,
}

impl Cache {
    pub fn new(root: AbsDirPath) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &AbsDirPath {
        &self.root
    }

    /// `<root>/inbound/gems/<full-name>.gem`
    pub fn inbound_gem(&self, full_name: &str) -> color_eyre::Result<AbsFilePath> {
        self.root
            .try_join_combined(["inbound", "gems"], format!("{full_name}.gem"))
    }

    /// `<root>/inbound/gits/<slug>/`
    pub fn inbound_repo(&self, source: &Source) -> color_eyre::Result<AbsDirPath> {
        self.root
            .try_join_dirs(["inbound".to_string(), "gits".to_string(), source.slug()])
    }

    /// `<root>/assembling/<abi>/<full-name>/`
    pub fn assembling(&self, abi: &Abi, full_name: &str) -> color_eyre::Result<AbsDirPath> {
        self.root.try_join_dirs([
            "assembling".to_string(),
            abi.to_string(),
            full_name.to_string(),
        ])
    }

    /// `<root>/cached/<abi>/<full-name>/`
    pub fn cached(&self, abi: &Abi, full_name: &str) -> color_eyre::Result<AbsDirPath> {
        self.root.try_join_dirs([
            "cached".to_string(),
            abi.to_string(),
            full_name.to_string(),
        ])
    }

    /// `<root>/cached/<abi>/<full-name>.spec.marshal`
    pub fn cached_spec(&self, abi: &Abi, full_name: &str) -> color_eyre::Result<AbsFilePath> {
        self.root.try_join_combined(
            ["cached", &abi.to_string()],
            format!("{full_name}.spec.marshal"),
        )
    }

    /// `<root>/cached/<abi>/<full-name>.manifest`
    pub fn cached_manifest(&self, abi: &Abi, full_name: &str) -> color_eyre::Result<AbsFilePath> {
        self.root.try_join_combined(
            ["cached", &abi.to_string()],
            format!("{full_name}.manifest"),
        )
    }

    /// `<root>/cached/<abi>/<full-name>/.swiftgem-complete`
    ///
    /// The completion marker written last during promotion; its presence is
    /// what distinguishes a fully promoted entry from a directory that merely
    /// exists (e.g. mid-rename observed by another process).
    pub fn completion_marker(&self, abi: &Abi, full_name: &str) -> color_eyre::Result<AbsFilePath> {
        self.cached(abi, full_name)?
            .try_join_file(".swiftgem-complete")
    }

    /// `<root>/index/<source-slug>/`
    pub fn index(&self, source: &Source) -> color_eyre::Result<AbsDirPath> {
        self.root
            .try_join_dirs(["index".to_string(), source.slug()])
    }

    /// The relative dir/file names used within [`Self::assembling`]/
    /// [`Self::cached`], exposed so materialization can reuse the same
    /// naming without recomputing it.
    pub fn full_name_of(artifact: &ResolvedArtifact) -> String {
        artifact.full_name()
    }
}

/// A relative path within a cache entry's tree, as recorded in a
/// `.manifest` file — the list of paths materialization must project.
pub type EntryRelPath = RelFilePath;

/// A relative directory within a cache entry's tree.
pub type EntryRelDir = RelDirPath;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::AbsDirPath;

    fn cache() -> Cache {
        Cache::new(AbsDirPath::try_from("/tmp/swiftgem-cache-test").unwrap())
    }

    fn abi() -> Abi {
        Abi {
            engine: "ruby".into(),
            interpreter_version: "3.3.0".into(),
            host_triple: "x86_64-linux-glibc2.35".into(),
        }
    }

    #[test]
    fn cached_and_assembling_share_full_name_but_not_stage() {
        let cache = cache();
        let abi = abi();
        let cached = cache.cached(&abi, "rake-13.0.6").unwrap();
        let assembling = cache.assembling(&abi, "rake-13.0.6").unwrap();
        assert_ne!(cached.as_std_path(), assembling.as_std_path());
        assert!(cached.as_std_path().ends_with("cached/ruby-3.3.0-x86_64-linux-glibc2.35/rake-13.0.6"));
    }

    #[test]
    fn same_source_slug_is_deterministic() {
        let source = Source::Index {
            roots: vec![url::Url::parse("https://rubygems.org").unwrap()],
        };
        assert_eq!(source.slug(), source.slug());
    }
}
