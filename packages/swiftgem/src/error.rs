//! The error taxonomy and its mapping to process exit codes.

use derive_more::Display;

/// The kind of failure that ended an install run.
///
/// Each variant maps to a distinct exit code (see [`InstallErrorKind::exit_code`]);
/// the scheduler records one of these per failed job, and `main` uses the
/// worst one observed to choose the process's exit status.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum InstallErrorKind {
    #[display("manifest")]
    Manifest,
    #[display("lockfile")]
    Lockfile,
    #[display("resolution")]
    Resolution,
    #[display("network")]
    Network,
    #[display("install")]
    Install,
    #[display("compilation")]
    Compilation,
    #[display("permission")]
    Permission,
    #[display("platform")]
    Platform,
    #[display("cache")]
    Cache,
}

impl InstallErrorKind {
    pub const fn exit_code(self) -> i32 {
        match self {
            InstallErrorKind::Manifest => 4,
            InstallErrorKind::Lockfile => 5,
            InstallErrorKind::Resolution => 6,
            InstallErrorKind::Network => 7,
            InstallErrorKind::Install => 8,
            InstallErrorKind::Compilation => 9,
            InstallErrorKind::Permission => 10,
            InstallErrorKind::Platform => 11,
            InstallErrorKind::Cache => 12,
        }
    }
}

impl std::error::Error for InstallErrorKind {}

/// A failure captured for a single artifact during an install run.
#[derive(Clone, Debug)]
pub struct ArtifactFailure {
    pub identifier: String,
    pub kind: InstallErrorKind,
    pub message: String,
}

impl std::fmt::Display for ArtifactFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.identifier, self.kind, self.message)
    }
}

/// The worst (highest-priority) exit code across a set of failures.
///
/// Earlier-listed kinds in [`InstallErrorKind`] take priority when a run
/// fails for more than one reason, since they reflect earlier pipeline
/// phases (a manifest error means nothing downstream even ran).
pub fn worst_exit_code(failures: &[ArtifactFailure]) -> i32 {
    failures
        .iter()
        .map(|f| f.kind.exit_code())
        .min()
        .unwrap_or(0)
}
