//! Explicit runtime configuration, constructed once at the CLI boundary.
//!
//! No module below the CLI layer reads `std::env` directly; everything that
//! varies by environment or flag flows through a [`Config`] value instead.

use std::env;

use color_eyre::{Result, eyre::Context};

use crate::{fs, path::AbsDirPath};

/// Runtime configuration threaded through every component constructor.
#[derive(Clone, Debug)]
pub struct Config {
    /// Root of the global, cross-project artifact cache.
    pub cache_root: AbsDirPath,

    /// Project-local install directory (defaults to `./vendor/swiftgem`).
    pub project_root: AbsDirPath,

    /// Worker count for the scheduler. `None` means "let the scheduler pick".
    pub jobs: Option<usize>,

    /// Abort the run as soon as any job fails.
    pub fail_fast: bool,

    /// Whether to respect interpreter upper-bound constraints (`ruby: "< 3.0"`)
    /// during resolution. Off by default: upstream upper bounds are the
    /// single largest source of spurious resolution failures.
    pub respect_interpreter_upper_bounds: bool,

    /// Emit verbose, human-oriented progress in addition to structured logs.
    pub verbose: bool,
}

impl Config {
    /// Build configuration from the process environment and CLI overrides.
    ///
    /// `cache_root_override` and `project_root_override` come from `--path`
    /// and `SWIFTGEM_CACHE_DIR` respectively; this is the only place either
    /// environment variable is read.
    pub async fn load(
        cache_root_override: Option<AbsDirPath>,
        project_root_override: Option<AbsDirPath>,
        jobs: Option<usize>,
        fail_fast: bool,
        verbose: bool,
    ) -> Result<Self> {
        let cache_root = match cache_root_override {
            Some(dir) => dir,
            None => match env::var("SWIFTGEM_CACHE_DIR") {
                Ok(dir) => AbsDirPath::try_from(dir).context("parse SWIFTGEM_CACHE_DIR")?,
                Err(_) => fs::user_global_cache_path().await?,
            },
        };

        let project_root = match project_root_override {
            Some(dir) => dir,
            None => {
                let cwd = env::current_dir().context("get current directory")?;
                AbsDirPath::try_from(cwd.join("vendor").join("swiftgem"))
                    .context("build default project root")?
            }
        };

        let respect_interpreter_upper_bounds = env::var("SWIFTGEM_RESPECT_INTERPRETER_UPPER_BOUNDS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            cache_root,
            project_root,
            jobs,
            fail_fast,
            respect_interpreter_upper_bounds,
            verbose,
        })
    }

    /// Look up a host-scoped credential, e.g. `SWIFTGEM_CREDENTIAL_GEMS_EXAMPLE_COM`.
    pub fn host_credential(&self, host: &str) -> Option<String> {
        let key = format!(
            "SWIFTGEM_CREDENTIAL_{}",
            host.to_ascii_uppercase().replace(['.', '-'], "_")
        );
        env::var(key).ok()
    }
}
