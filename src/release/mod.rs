//! Release tagging logic for the repository's release tool.
//!
//! Tags follow the module convention: the root module is tagged
//! `vX.Y.Z`, a sub-module at `path` is tagged `path/vX.Y.Z`. Prerelease
//! tags append `-prereleaseNN` with a strict two-digit number in
//! `01..99`. All computation lives here; the `release` binary only
//! gathers tags from git and applies the plan.

mod version;

pub use version::{normalize, Prerelease, ReleaseError, Version, VersionType};

use std::collections::HashMap;

/// A raw git tag, parsed.
#[derive(Debug, Clone)]
pub struct ParsedTag {
    pub raw: String,
    /// Module path; empty for the root module.
    pub module_path: String,
    /// The version component, when the tag is a version tag.
    pub version: Option<Version>,
}

/// A module that receives tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    /// Repo-relative path; empty for the root module.
    pub path: String,
    /// Latest released version of the module.
    pub version: Version,
}

/// A planned release step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CreateTag { tag: String },
    PushTag { tag: String },
}

/// Parse one raw tag. Non-version tags parse with `version: None`.
pub fn parse_tag(raw: &str) -> ParsedTag {
    let (module_path, version_part) = match raw.rfind("/v") {
        Some(idx) => (&raw[..idx], &raw[idx + 1..]),
        None => ("", raw),
    };
    ParsedTag {
        raw: raw.to_string(),
        module_path: module_path.to_string(),
        version: version_part.parse().ok(),
    }
}

/// The tag name for a module at a version.
pub fn tag_name(module_path: &str, version: &Version) -> String {
    if module_path.is_empty() {
        version.to_string()
    } else {
        format!("{module_path}/{version}")
    }
}

/// All known release tags, indexed for version computation.
#[derive(Debug, Default)]
pub struct TagCache {
    all: Vec<ParsedTag>,
    by_module: HashMap<String, Vec<ParsedTag>>,
    /// Prerelease suffixes per clean base version string.
    prereleases: HashMap<String, Vec<Prerelease>>,
    highest: Option<Version>,
}

impl TagCache {
    /// Build the cache from raw git tags.
    pub fn build<S: AsRef<str>>(raw_tags: &[S]) -> Self {
        let mut cache = TagCache::default();
        for raw in raw_tags {
            let tag = parse_tag(raw.as_ref());
            let Some(version) = tag.version.clone() else {
                cache.all.push(tag);
                continue;
            };

            if let Some(prerelease) = version.prerelease {
                cache
                    .prereleases
                    .entry(version.base().to_string())
                    .or_default()
                    .push(prerelease);
            }
            if cache
                .highest
                .as_ref()
                .map(|highest| version > *highest)
                .unwrap_or(true)
            {
                cache.highest = Some(version.clone());
            }
            cache
                .by_module
                .entry(tag.module_path.clone())
                .or_default()
                .push(tag.clone());
            cache.all.push(tag);
        }
        cache
    }

    /// The highest version tag across all modules, `v0.0.0` when none.
    pub fn current_global_version(&self) -> Version {
        self.highest.clone().unwrap_or_else(Version::zero)
    }

    /// The latest version of one module, `v0.0.0` when unreleased.
    pub fn latest_version_for_module(&self, module_path: &str) -> Version {
        self.by_module
            .get(module_path)
            .into_iter()
            .flatten()
            .filter_map(|tag| tag.version.clone())
            .max()
            .unwrap_or_else(Version::zero)
    }

    /// The next prerelease of a base version.
    ///
    /// First prerelease is `01`; numbering is strictly two-digit and caps
    /// at `99`. A latest prerelease written in legacy 1-digit form is a
    /// fatal error rather than a guess.
    pub fn next_prerelease(&self, base: &Version) -> Result<Version, ReleaseError> {
        let clean = base.base();
        let mut next = Version {
            prerelease: Some(Prerelease {
                number: 1,
                width: 2,
            }),
            ..clean.clone()
        };

        let Some(existing) = self.prereleases.get(&clean.to_string()) else {
            return Ok(next);
        };
        let latest = existing
            .iter()
            .max_by_key(|prerelease| prerelease.number)
            .expect("prerelease lists are never empty");

        if latest.width != 2 {
            return Err(ReleaseError::OneDigitPrerelease {
                base: clean.to_string(),
            });
        }
        if latest.number + 1 > 99 {
            return Err(ReleaseError::PrereleaseOverflow {
                base: clean.to_string(),
            });
        }
        next.prerelease = Some(Prerelease {
            number: latest.number + 1,
            width: 2,
        });
        Ok(next)
    }

    /// Compute the target version from the release arguments.
    ///
    /// An explicit version wins; otherwise the current global version is
    /// incremented by `version_type`. With `prerelease` set, the result
    /// becomes the next prerelease of that base.
    pub fn calculate_new_version(
        &self,
        explicit: Option<&str>,
        version_type: Option<VersionType>,
        prerelease: bool,
    ) -> Result<Version, ReleaseError> {
        if let Some(explicit) = explicit {
            let version = normalize(explicit)?;
            if prerelease && version.prerelease.is_none() {
                return self.next_prerelease(&version);
            }
            return Ok(version);
        }

        let current = self.current_global_version();
        let target = match version_type {
            Some(version_type) => current.increment(version_type),
            // Prerelease-only: renumber against the current base.
            None => current.base(),
        };
        if prerelease {
            return self.next_prerelease(&target);
        }
        Ok(target)
    }

    /// Fail when any module already carries the target version's tag.
    pub fn check_version_exists(
        &self,
        version: &Version,
        modules: &[Module],
    ) -> Result<(), ReleaseError> {
        let existing: Vec<String> = modules
            .iter()
            .map(|module| tag_name(&module.path, version))
            .filter(|expected| self.all.iter().any(|tag| tag.raw == *expected))
            .collect();
        if existing.is_empty() {
            Ok(())
        } else {
            Err(ReleaseError::VersionExists(existing))
        }
    }

    /// Modules discovered in the repo, stamped with their latest version.
    pub fn resolve_modules<S: AsRef<str>>(&self, module_paths: &[S]) -> Vec<Module> {
        let mut seen = std::collections::HashSet::new();
        module_paths
            .iter()
            .map(|path| {
                let path = path.as_ref().trim_start_matches("./");
                if path == "." {
                    ""
                } else {
                    path
                }
            })
            .filter(|path| seen.insert(path.to_string()))
            .map(|path| Module {
                path: path.to_string(),
                version: self.latest_version_for_module(path),
            })
            .collect()
    }
}

/// Plan tag creation and pushing for every module.
pub fn plan_release(modules: &[Module], target: &Version) -> Vec<Action> {
    let mut actions = Vec::with_capacity(modules.len() * 2);
    for module in modules {
        let tag = tag_name(&module.path, target);
        actions.push(Action::CreateTag { tag: tag.clone() });
        actions.push(Action::PushTag { tag });
    }
    actions
}
