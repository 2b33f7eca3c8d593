//! Resolver adapter: translates this installer's gem-style constraint
//! grammar and index data into a greedy, newest-first worklist solve over
//! the compact index.
//!
//! This is not a backtracking solver: each name is settled to the newest
//! candidate that satisfies every constraint known about it at the time it
//! is dequeued (its own manifest request plus every declared-dependency edge
//! seen so far), and a name is never revisited once settled. That is
//! sufficient for the common case (a consistent index with no diamond
//! conflicts that require backtracking to resolve) but will surface as
//! "no version satisfies its constraints" rather than backtrack-and-retry
//! on a genuine conflict.

use std::{collections::BTreeMap, sync::Arc};

use color_eyre::{Result, eyre::Context};
use tracing::{instrument, warn};

use crate::{
    config::Config,
    index::{IndexClient, VersionsRecord},
    model::{Abi, Comparator, DependencyRequest, Platform, ResolvedArtifact, Source, Version},
};

/// Bridges the compact-index client and the interpreter/platform filters
/// onto the three operations a version solver needs: candidate versions,
/// dependency edges, and locked-version reordering (see [`resolve`] for the
/// solve loop itself).
///
/// Per-gem index data (`versions_of`, `dependencies_of`) is fetched lazily
/// and memoized, since a resolution run only needs the transitive closure of
/// the manifest's direct dependencies, not the whole index.
pub struct ResolverAdapter {
    client: IndexClient,
    config: Config,
    abi: Abi,
    locked: BTreeMap<String, Version>,
    versions_cache: dashmap::DashMap<String, Arc<VersionsRecord>>,
    deps_cache: dashmap::DashMap<(String, Version), Vec<(String, Vec<Comparator>)>>,
}

impl ResolverAdapter {
    pub fn new(client: IndexClient, config: Config, abi: Abi, locked: BTreeMap<String, Version>) -> Self {
        Self {
            client,
            config,
            abi,
            locked,
            versions_cache: dashmap::DashMap::new(),
            deps_cache: dashmap::DashMap::new(),
        }
    }

    /// Candidate versions for `name`, filtered by platform and interpreter
    /// requirements, newest first, with the locked version (if any) moved to
    /// the front.
    #[instrument(skip(self))]
    pub async fn versions_of(&self, name: &str) -> Result<Vec<Version>> {
        let record = self.versions_record(name).await?;
        let mut candidates: Vec<Version> = record
            .versions
            .iter()
            .filter(|(_, platform)| self.platform_matches(platform))
            .map(|(version, _)| version.clone())
            .collect();
        candidates.sort_by(|a, b| b.cmp(a));
        candidates.dedup();

        Ok(self.candidate_order(name, candidates))
    }

    /// Reorder candidates so a previously locked version is tried first.
    pub fn candidate_order(&self, name: &str, mut versions: Vec<Version>) -> Vec<Version> {
        if let Some(locked) = self.locked.get(name) {
            if let Some(pos) = versions.iter().position(|v| v == locked) {
                let locked = versions.remove(pos);
                versions.insert(0, locked);
            }
        }
        versions
    }

    /// Runtime dependency edges for a specific `(name, version)`, merged
    /// across platform variants (the chosen variant is not known until the
    /// solver picks one).
    #[instrument(skip(self))]
    pub async fn dependencies_of(&self, name: &str, version: &Version) -> Result<Vec<(String, Vec<Comparator>)>> {
        let key = (name.to_string(), version.clone());
        if let Some(cached) = self.deps_cache.get(&key) {
            return Ok(cached.clone());
        }

        let record = self.versions_record(name).await?;
        let records = self
            .client
            .info(name, Some(record.fingerprint.as_str()))
            .await
            .context("fetch info record")?;

        let mut merged: BTreeMap<String, Vec<Comparator>> = BTreeMap::new();
        for info in records.iter().filter(|r| &r.version == version) {
            if !self.interpreter_requirements_satisfied(&info.requirements) {
                continue;
            }
            for (dep_name, constraints) in &info.dependencies {
                merged
                    .entry(dep_name.clone())
                    .or_default()
                    .extend(constraints.iter().cloned());
            }
        }

        let deps: Vec<_> = merged.into_iter().collect();
        self.deps_cache.insert(key, deps.clone());
        Ok(deps)
    }

    /// Warm the per-gem info cache for a batch of names concurrently, so the
    /// scheduler can prefetch before the solver actually needs the data.
    #[instrument(skip(self, names))]
    pub async fn prefetch(&self, names: &[String]) -> Result<()> {
        for name in names {
            let record = self.versions_record(name).await?;
            let _ = self
                .client
                .info(name, Some(record.fingerprint.as_str()))
                .await;
        }
        Ok(())
    }

    async fn versions_record(&self, name: &str) -> Result<Arc<VersionsRecord>> {
        if let Some(cached) = self.versions_cache.get(name) {
            return Ok(cached.clone());
        }
        let all = self.client.versions().await.context("fetch versions index")?;
        for (n, record) in all {
            self.versions_cache.insert(n, Arc::new(record));
        }
        self.versions_cache
            .get(name)
            .map(|r| r.clone())
            .with_context(|| format!("gem not found in index: {name}"))
    }

    fn platform_matches(&self, platform: &Platform) -> bool {
        match platform {
            Platform::Portable => true,
            Platform::Specific(p) => self.abi.host_triple.contains(p.as_str()) || p == "ruby",
        }
    }

    /// Whether a candidate's `ruby:`/`rubygems:` requirements are satisfiable
    /// given the current ABI's interpreter version. Upper bounds are ignored
    /// by default (see [`Config::respect_interpreter_upper_bounds`]) because
    /// upstream upper bounds are the single largest source of spurious
    /// resolution failures against a newer interpreter than the gem author
    /// tested against.
    fn interpreter_requirements_satisfied(&self, requirements: &[(String, Vec<Comparator>)]) -> bool {
        let Some((_, constraints)) = requirements.iter().find(|(name, _)| name == "ruby") else {
            return true;
        };
        let current = Version::parse(&self.abi.interpreter_version);
        constraints.iter().all(|c| match c {
            Comparator::Lt(_) | Comparator::Lte(_) if !self.config.respect_interpreter_upper_bounds => {
                warn!(
                    interpreter = %self.abi.interpreter_version,
                    "ignoring interpreter upper bound (respect_interpreter_upper_bounds=false)"
                );
                true
            }
            _ => comparator_satisfied(c, &current),
        })
    }
}

fn comparator_satisfied(c: &Comparator, actual: &Version) -> bool {
    match c {
        Comparator::Gte(v) => actual >= v,
        Comparator::Gt(v) => actual > v,
        Comparator::Lte(v) => actual <= v,
        Comparator::Lt(v) => actual < v,
        Comparator::Eq(v) => actual == v,
        Comparator::Neq(v) => actual != v,
        Comparator::Pessimistic(v) => actual >= v && actual < &pessimistic_upper_bound(v),
    }
}

/// The exclusive upper bound of `~> v`: drop `v`'s last numeric segment and
/// bump the new last segment by one, e.g. `~> 1.2.3` allows up to (not
/// including) `1.3.0`, and `~> 1.2` allows up to (not including) `2.0`.
/// Non-numeric trailing segments (pre-release suffixes) never narrow the
/// bound, since a pessimistic operator is only meaningful against a
/// numeric-segment prefix.
fn pessimistic_upper_bound(v: &Version) -> Version {
    let mut segments = v.numeric_segments();
    if segments.is_empty() {
        segments.push(0);
    }
    if segments.len() > 1 {
        segments.truncate(segments.len() - 1);
    }
    if let Some(last) = segments.last_mut() {
        *last += 1;
    }
    let raw = segments.iter().map(u64::to_string).collect::<Vec<_>>().join(".");
    Version::parse(raw)
}

/// Resolve a set of top-level dependency requests against the given source
/// into a fully pinned artifact set.
///
/// Each queued name carries every constraint declared against it so far:
/// its own manifest request, if any, plus the constraint half of every
/// `(dep_name, constraint)` edge that named it as a dependency. A purely
/// transitive dependency is checked against its parent's declared
/// requirement, not accepted unconditionally.
#[instrument(skip(adapter, requests))]
pub async fn resolve(
    adapter: &ResolverAdapter,
    requests: &[DependencyRequest],
    source: &Source,
) -> Result<Vec<ResolvedArtifact>> {
    // Prefetch every direct dependency's info record so the solve loop
    // below never blocks on the network mid-iteration.
    let names: Vec<String> = requests.iter().map(|r| r.name.clone()).collect();
    adapter.prefetch(&names).await?;

    let mut resolved = Vec::new();
    let mut queue: Vec<String> = names.clone();
    let mut constraints: BTreeMap<String, Vec<Comparator>> = BTreeMap::new();
    for request in requests {
        constraints
            .entry(request.name.clone())
            .or_default()
            .extend(request.constraints.iter().cloned());
    }
    let mut seen = std::collections::BTreeSet::new();

    while let Some(name) = queue.pop() {
        if !seen.insert(name.clone()) {
            continue;
        }
        let candidates = adapter.versions_of(&name).await?;
        let empty = Vec::new();
        let wanted = constraints.get(&name).unwrap_or(&empty);
        let version = pick_version(candidates, wanted)
            .with_context(|| format!("no version of {name} satisfies its constraints"))?;

        let deps = adapter.dependencies_of(&name, &version).await?;
        for (dep_name, dep_constraints) in &deps {
            constraints
                .entry(dep_name.clone())
                .or_default()
                .extend(dep_constraints.iter().cloned());
            queue.push(dep_name.clone());
            adapter.prefetch(std::slice::from_ref(dep_name)).await?;
        }

        resolved.push(ResolvedArtifact {
            name: name.clone(),
            version: version.clone(),
            platform: crate::model::Platform::Portable,
            dependencies: deps.iter().map(|(n, _)| (n.clone(), version.clone())).collect(),
            source: source.clone(),
            needs_compilation: false,
            content_hash: None,
        });
    }

    Ok(resolved)
}

/// Pick the newest candidate satisfying every constraint known for a name at
/// dequeue time. Factored out of [`resolve`]'s loop so the
/// constraint-threading behavior (a candidate must satisfy not just a
/// top-level manifest request but every parent's declared dependency
/// constraint) is directly testable without a live index.
fn pick_version(candidates: Vec<Version>, constraints: &[Comparator]) -> Option<Version> {
    candidates
        .into_iter()
        .find(|v| constraints.iter().all(|c| comparator_satisfied(c, v)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparator_satisfied_respects_pessimistic_lower_bound() {
        let base = Version::parse("1.2.0");
        let candidate = Version::parse("1.2.5");
        assert!(comparator_satisfied(&Comparator::Pessimistic(base.clone()), &candidate));
        assert!(!comparator_satisfied(&Comparator::Pessimistic(base), &Version::parse("1.1.9")));
    }

    #[test]
    fn comparator_satisfied_rejects_pessimistic_upper_bound() {
        let base = Version::parse("1.2.0");
        assert!(!comparator_satisfied(&Comparator::Pessimistic(base.clone()), &Version::parse("1.3.0")));
        assert!(!comparator_satisfied(&Comparator::Pessimistic(base), &Version::parse("2.0.0")));
    }

    #[test]
    fn pessimistic_upper_bound_bumps_the_second_to_last_segment() {
        assert_eq!(pessimistic_upper_bound(&Version::parse("1.2.3")), Version::parse("1.3"));
        assert_eq!(pessimistic_upper_bound(&Version::parse("1.2")), Version::parse("2"));
    }

    proptest::proptest! {
        /// `~> major.minor.patch` must accept any patch bump within the same
        /// minor line and reject any minor-or-above bump, independent of the
        /// concrete magnitudes involved.
        #[test]
        fn pessimistic_accepts_patch_bumps_and_rejects_minor_bumps(
            major in 0u64..20,
            minor in 0u64..20,
            patch in 0u64..20,
            patch_bump in 0u64..20,
        ) {
            let base = Version::parse(format!("{major}.{minor}.{patch}"));
            let same_minor = Version::parse(format!("{major}.{minor}.{}", patch + patch_bump));
            let next_minor = Version::parse(format!("{major}.{}.0", minor + 1));
            prop_assert!(comparator_satisfied(&Comparator::Pessimistic(base.clone()), &same_minor));
            prop_assert!(!comparator_satisfied(&Comparator::Pessimistic(base), &next_minor));
        }
    }

    #[test]
    fn pick_version_enforces_a_purely_transitive_constraint() {
        // No top-level manifest request names this package; the only
        // constraint on it comes from a parent's declared dependency edge.
        // The newest candidate violates that edge and must be skipped.
        let candidates = vec![Version::parse("2.0.0"), Version::parse("1.5.0"), Version::parse("1.0.0")];
        let transitive_constraint = vec![Comparator::Lt(Version::parse("2.0.0"))];
        assert_eq!(pick_version(candidates, &transitive_constraint), Some(Version::parse("1.5.0")));
    }

    #[test]
    fn pick_version_returns_none_when_no_candidate_satisfies() {
        let candidates = vec![Version::parse("2.0.0"), Version::parse("2.1.0")];
        let constraint = vec![Comparator::Lt(Version::parse("2.0.0"))];
        assert_eq!(pick_version(candidates, &constraint), None);
    }

    #[test]
    fn pick_version_with_no_constraints_takes_the_first_candidate() {
        let candidates = vec![Version::parse("1.5.0"), Version::parse("1.0.0")];
        assert_eq!(pick_version(candidates, &[]), Some(Version::parse("1.5.0")));
    }
}
