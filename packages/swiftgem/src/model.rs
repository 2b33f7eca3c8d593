//! Core data types shared by every component: sources, requests, resolved
//! artifacts, cache identifiers, plan entries, and jobs.

use std::fmt;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::path::AbsDirPath;

/// A blake3 content hash, used to key cache entries and verify downloads.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn from_blake3(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", hex::encode(self.0))
    }
}

/// A published gem version, e.g. `1.2.3` or `1.2.3.pre1`.
///
/// Ordering compares `segments` only (numeric segments compare numerically,
/// string segments lexicographically, and `Num` sorts below `Str` when the
/// two differ at the same position). `raw` is display/round-trip data, not
/// part of the order: a derived field-order comparison would make `"1.10.0"`
/// sort below `"1.9.0"` since `'1' < '9'` as the first differing byte.
#[derive(Clone, Eq, PartialEq, Hash, Display, Debug, Serialize, Deserialize)]
#[display("{raw}")]
pub struct Version {
    raw: String,
    segments: Vec<VersionSegment>,
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.segments.cmp(&other.segments)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
enum VersionSegment {
    Num(u64),
    Str(String),
}

impl Version {
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let segments = raw
            .split(['.', '-'])
            .map(|part| match part.parse::<u64>() {
                Ok(n) => VersionSegment::Num(n),
                Err(_) => VersionSegment::Str(part.to_string()),
            })
            .collect();
        Self { raw, segments }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The leading run of numeric segments, stopping at the first
    /// non-numeric one (pre-release suffixes like `.pre1` aren't meaningful
    /// input to a numeric-only computation such as the `~>` upper bound).
    pub(crate) fn numeric_segments(&self) -> Vec<u64> {
        self.segments
            .iter()
            .take_while(|s| matches!(s, VersionSegment::Num(_)))
            .map(|s| match s {
                VersionSegment::Num(n) => *n,
                VersionSegment::Str(_) => unreachable!(),
            })
            .collect()
    }
}

/// The host-arch platform tag attached to a gem, e.g. `ruby` (portable),
/// `x86_64-linux`, `arm64-darwin`.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display, Debug, Serialize, Deserialize)]
pub enum Platform {
    #[display("ruby")]
    Portable,
    #[display("{_0}")]
    Specific(String),
}

impl Platform {
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() || raw == "ruby" {
            Platform::Portable
        } else {
            Platform::Specific(raw.to_string())
        }
    }

    pub fn is_portable(&self) -> bool {
        matches!(self, Platform::Portable)
    }
}

/// A version comparator as it appears in manifests, lockfiles, and index
/// dependency records: `~>`, `>=`, `>`, `<=`, `<`, `=`, `!=`.
#[derive(Clone, Eq, PartialEq, Hash, Display, Debug, Serialize, Deserialize)]
pub enum Comparator {
    #[display(">= {_0}")]
    Gte(Version),
    #[display("> {_0}")]
    Gt(Version),
    #[display("<= {_0}")]
    Lte(Version),
    #[display("< {_0}")]
    Lt(Version),
    #[display("= {_0}")]
    Eq(Version),
    #[display("!= {_0}")]
    Neq(Version),
    #[display("~> {_0}")]
    Pessimistic(Version),
}

/// A source descriptor: where a gem's data and bytes come from.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum Source {
    /// An ordered list of compact-index roots. The first is primary.
    Index { roots: Vec<Url> },
    /// A git repository pinned to an immutable revision.
    Repository {
        uri: Url,
        branch: Option<String>,
        tag: Option<String>,
        revision: String,
        submodules: bool,
        glob: Option<String>,
    },
    /// A local filesystem path, consumed as-is.
    Path { root: AbsDirPath, glob: Option<String> },
}

impl Source {
    /// A stable, human-decodable slug identifying this source's cache namespace.
    pub fn slug(&self) -> String {
        match self {
            Source::Index { roots } => {
                let primary = roots.first().map(Url::as_str).unwrap_or_default();
                slugify(primary)
            }
            Source::Repository { uri, .. } => slugify(uri.as_str()),
            Source::Path { root, .. } => slugify(root.as_std_path().to_string_lossy().as_ref()),
        }
    }
}

fn slugify(raw: &str) -> String {
    let hash = blake3::hash(raw.as_bytes());
    let short = hex::encode(&hash.as_bytes()[..8]);
    let stem: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let stem = stem.trim_matches('-');
    let stem: String = stem.chars().take(48).collect();
    format!("{stem}-{short}")
}

/// A single dependency declaration as parsed from the manifest.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct DependencyRequest {
    pub name: String,
    pub constraints: Vec<Comparator>,
    pub groups: Vec<String>,
    pub platforms: Vec<String>,
    pub source: Option<Source>,
}

/// A fully resolved artifact: a specific gem/version/platform pinned to a
/// specific source, with its own runtime dependency edges.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct ResolvedArtifact {
    pub name: String,
    pub version: Version,
    pub platform: Platform,
    pub dependencies: Vec<(String, Version)>,
    pub source: Source,
    pub needs_compilation: bool,
    pub content_hash: Option<ContentHash>,
}

/// The ABI key: the three-tuple that disambiguates cache entries that need
/// native compilation from each other across interpreter engine, interpreter
/// version, and host triple.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display, Debug, Serialize, Deserialize)]
#[display("{engine}-{interpreter_version}-{host_triple}")]
pub struct Abi {
    pub engine: String,
    pub interpreter_version: String,
    pub host_triple: String,
}

impl ResolvedArtifact {
    /// The canonical full name: `name-version[-platform]`.
    pub fn full_name(&self) -> String {
        match &self.platform {
            Platform::Portable => format!("{}-{}", self.name, self.version),
            Platform::Specific(p) => format!("{}-{}-{p}", self.name, self.version),
        }
    }
}

/// An artifact identifier: a full name plus the ABI key that addresses its
/// cache entry.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct ArtifactId {
    pub full_name: String,
    pub abi: Abi,
}

/// The action the planner has decided for a single resolved artifact.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Serialize, Deserialize)]
pub enum PlanAction {
    Skip,
    Link,
    BuildExt,
    Download,
}

/// A single entry in the install plan.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct PlanEntry {
    pub artifact: ResolvedArtifact,
    pub action: PlanAction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_digit_component_sorts_above_single_digit() {
        assert!(Version::parse("1.10.0") > Version::parse("1.9.0"));
    }

    #[test]
    fn missing_trailing_segment_sorts_below_explicit_zero() {
        assert!(Version::parse("1.2") < Version::parse("1.2.0"));
    }

    #[test]
    fn numeric_segment_sorts_below_string_segment_at_same_position() {
        assert!(Version::parse("1.0") < Version::parse("1.pre"));
    }

    #[test]
    fn equal_segments_compare_equal_regardless_of_raw_spelling() {
        assert_eq!(Version::parse("1.2.3").cmp(&Version::parse("1.2.3")), std::cmp::Ordering::Equal);
    }

    proptest::proptest! {
        /// Version ordering must stay monotonic in each numeric component:
        /// bumping any one segment (holding the earlier ones fixed) never
        /// decreases the overall order, independent of how wide the bumped
        /// digit string is (guards the `raw`-string-comparison regression).
        #[test]
        fn version_ordering_is_monotonic_in_each_segment(
            major in 0u64..50,
            minor in 0u64..50,
            patch in 0u64..50,
            bump in 1u64..50,
        ) {
            let base = Version::parse(format!("{major}.{minor}.{patch}"));
            let bumped_patch = Version::parse(format!("{major}.{minor}.{}", patch + bump));
            let bumped_minor = Version::parse(format!("{major}.{}.0", minor + bump));
            let bumped_major = Version::parse(format!("{}.0.0", major + bump));
            prop_assert!(bumped_patch > base);
            prop_assert!(bumped_minor > base);
            prop_assert!(bumped_major > base);
        }
    }
}
