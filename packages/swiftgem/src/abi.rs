//! ABI key computation: the `(engine, interpreter_version, host_triple)`
//! triple that disambiguates native-extension cache entries.
//!
//! Two hosts that differ only in libc flavor or version are not
//! binary-compatible for compiled extensions, so the host triple baked into
//! the ABI key includes libc detection, not just the compiler's target
//! triple.

use color_eyre::Result;
use tracing::debug;

use crate::model::Abi;

/// The interpreter engine family. Only the reference (MRI/CRuby) engine is
/// supported; this is a tagged variant so a future engine is additive rather
/// than a breaking change to [`Abi`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Engine {
    Mri,
}

impl Engine {
    pub fn as_str(self) -> &'static str {
        match self {
            Engine::Mri => "ruby",
        }
    }
}

/// The detected libc flavor and version of the current host system.
///
/// Returns `Unknown` if detection fails, which results in the most
/// conservative caching behavior (only compatible with other Unknown hosts).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum LibcVersion {
    Glibc { major: u32, minor: u32 },
    Musl,
    Darwin { major: u32, minor: u32 },
    Windows,
    Unknown,
}

impl std::fmt::Display for LibcVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LibcVersion::Glibc { major, minor } => write!(f, "glibc{major}.{minor}"),
            LibcVersion::Musl => write!(f, "musl"),
            LibcVersion::Darwin { major, minor } => write!(f, "darwin{major}.{minor}"),
            LibcVersion::Windows => write!(f, "msvc"),
            LibcVersion::Unknown => write!(f, "unknown"),
        }
    }
}

/// Detect the libc version of the current host system.
pub fn detect_host_libc() -> LibcVersion {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        detect_glibc().unwrap_or_else(|err| {
            debug!(?err, "failed to detect glibc version, using Unknown");
            LibcVersion::Unknown
        })
    }

    #[cfg(all(target_os = "linux", target_env = "musl"))]
    {
        LibcVersion::Musl
    }

    #[cfg(target_os = "macos")]
    {
        detect_darwin().unwrap_or_else(|err| {
            debug!(?err, "failed to detect Darwin version, using Unknown");
            LibcVersion::Unknown
        })
    }

    #[cfg(target_os = "windows")]
    {
        LibcVersion::Windows
    }

    #[cfg(not(any(
        all(target_os = "linux", target_env = "gnu"),
        all(target_os = "linux", target_env = "musl"),
        target_os = "macos",
        target_os = "windows"
    )))]
    {
        LibcVersion::Unknown
    }
}

/// Detect glibc version using the `gnu_get_libc_version` function.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn detect_glibc() -> Result<LibcVersion> {
    use color_eyre::eyre::{Context, bail};
    use std::ffi::CStr;

    // SAFETY: gnu_get_libc_version returns a pointer to a static string
    // that is valid for the lifetime of the program.
    let version_ptr = unsafe { libc::gnu_get_libc_version() };
    if version_ptr.is_null() {
        bail!("gnu_get_libc_version returned null");
    }

    // SAFETY: The pointer is non-null and points to a valid C string.
    let version_str = unsafe { CStr::from_ptr(version_ptr) }
        .to_str()
        .context("glibc version is not valid UTF-8")?;

    debug!(version = %version_str, "detected glibc version");

    let parts = version_str.split('.').collect::<Vec<_>>();
    if parts.len() < 2 {
        bail!("unexpected glibc version format: {version_str}");
    }

    let major = parts[0]
        .parse::<u32>()
        .context("failed to parse glibc major version")?;
    let minor = parts[1]
        .parse::<u32>()
        .context("failed to parse glibc minor version")?;

    Ok(LibcVersion::Glibc { major, minor })
}

/// Detect Darwin (macOS) version using uname.
#[cfg(target_os = "macos")]
fn detect_darwin() -> Result<LibcVersion> {
    use color_eyre::eyre::{Context, bail};
    use std::ffi::CStr;
    use std::mem::MaybeUninit;

    let mut utsname = MaybeUninit::<libc::utsname>::uninit();

    // SAFETY: uname writes to the provided buffer and returns 0 on success.
    let result = unsafe { libc::uname(utsname.as_mut_ptr()) };
    if result != 0 {
        bail!("uname failed with result: {result}");
    }

    // SAFETY: uname succeeded, so utsname is now initialized.
    let utsname = unsafe { utsname.assume_init() };

    // SAFETY: release is a null-terminated C string filled by uname.
    let release = unsafe { CStr::from_ptr(utsname.release.as_ptr()) }
        .to_str()
        .context("Darwin release is not valid UTF-8")?;

    debug!(release = %release, "detected Darwin release");

    let parts = release.split('.').collect::<Vec<_>>();
    if parts.len() < 2 {
        bail!("unexpected Darwin version format: {release}");
    }

    let major = parts[0]
        .parse::<u32>()
        .context("failed to parse Darwin major version")?;
    let minor = parts[1]
        .parse::<u32>()
        .context("failed to parse Darwin minor version")?;

    Ok(LibcVersion::Darwin { major, minor })
}

/// Compute the ABI key for the current process, given the interpreter
/// version the manifest (or its default) declares.
///
/// `interpreter_version` should come from the manifest's `ruby "..."`
/// directive if present, else a compiled-in default compatible with the
/// widest range of published gems.
pub fn current(interpreter_version: &str) -> Abi {
    let target = env!("SWIFTGEM_TARGET");
    let libc = detect_host_libc();
    let host_triple = format!("{target}-{libc}");
    Abi {
        engine: Engine::Mri.as_str().to_string(),
        interpreter_version: interpreter_version.to_string(),
        host_triple,
    }
}

/// The default interpreter version used when the manifest does not pin one.
pub const DEFAULT_INTERPRETER_VERSION: &str = "3.3.0";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_host_libc_returns_valid_version() {
        let version = detect_host_libc();
        #[cfg(all(target_os = "linux", target_env = "gnu"))]
        {
            match version {
                LibcVersion::Glibc { major, minor } => {
                    assert!(major >= 2, "glibc major version should be >= 2");
                    assert!(minor < 100, "glibc minor version should be reasonable");
                }
                _ => panic!("expected Glibc on Linux GNU, got {version:?}"),
            }
        }

        #[cfg(all(target_os = "linux", target_env = "musl"))]
        {
            assert!(matches!(version, LibcVersion::Musl));
        }
    }

    #[test]
    fn abi_key_includes_interpreter_version() {
        let abi = current("3.2.1");
        assert_eq!(abi.interpreter_version, "3.2.1");
        assert_eq!(abi.engine, "ruby");
    }
}
