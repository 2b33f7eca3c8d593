//! The runtime map: a binary `name -> {version, load_paths}` structure
//! written into the project-local directory for the (external) runtime
//! launcher to read and inject into the child process's library search
//! path.
//!
//! Serialized with `bincode`-style determinism via `serde`+`bon`'s existing
//! `serde_json`/binary patterns in this workspace; we reuse `serde_json` for
//! the on-disk form since no separate binary codec is otherwise part of this
//! workspace's stack and the map is small (one entry per resolved artifact).

use std::collections::BTreeMap;

use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::{fs, path::AbsFilePath};

/// A single entry: the pinned version plus the ordered load paths the
/// runtime launcher should add to its search path for this gem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEntry {
    pub version: String,
    pub load_paths: Vec<String>,
}

/// `name -> entry`, sorted by name for deterministic serialization.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeMap(pub BTreeMap<String, RuntimeEntry>);

impl RuntimeMap {
    pub fn insert(&mut self, name: impl Into<String>, version: impl Into<String>, load_paths: Vec<String>) {
        self.0.insert(name.into(), RuntimeEntry { version: version.into(), load_paths });
    }
}

/// Write the runtime map atomically to `path`.
pub async fn write(path: &AbsFilePath, map: &RuntimeMap) -> Result<()> {
    let bytes = serde_json::to_vec(map)?;
    fs::atomic_write(path, bytes).await
}

/// Read a previously written runtime map.
pub async fn read(path: &AbsFilePath) -> Result<Option<RuntimeMap>> {
    match fs::read_buffered(path).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::AbsDirPath;

    #[tokio::test]
    async fn round_trips_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = AbsDirPath::try_from(tmp.path().to_path_buf()).unwrap();
        let path = AbsFilePath::try_from(dir.as_std_path().join("runtime_map.json")).unwrap();

        let mut map = RuntimeMap::default();
        map.insert("rake", "13.0.6", vec!["lib".to_string()]);
        write(&path, &map).await.unwrap();

        let read_back = read(&path).await.unwrap().unwrap();
        assert_eq!(read_back, map);
    }

    #[tokio::test]
    async fn read_of_missing_file_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = AbsDirPath::try_from(tmp.path().to_path_buf()).unwrap();
        let path = AbsFilePath::try_from(dir.as_std_path().join("absent.json")).unwrap();
        assert!(read(&path).await.unwrap().is_none());
    }
}
