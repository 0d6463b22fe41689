//! Release version grammar: `vX.Y.Z` with an optional strict two-digit
//! `-prereleaseNN` suffix.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors from version parsing and computation.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReleaseError {
    #[error("invalid semantic version: {0}")]
    InvalidVersion(String),

    #[error("invalid version type: {0}")]
    InvalidVersionType(String),

    #[error("latest prerelease uses 1-digit format, only 2-digit format is supported, base ({base})")]
    OneDigitPrerelease { base: String },

    #[error("maximum prerelease number (99) exceeded, base ({base})")]
    PrereleaseOverflow { base: String },

    #[error("version already exists for modules: {0:?}")]
    VersionExists(Vec<String>),
}

/// Prerelease suffix: the number plus the digit width it was written
/// with. Width matters: only the 2-digit form is valid going forward,
/// and a legacy 1-digit latest tag must fail loudly instead of being
/// silently renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prerelease {
    pub number: u32,
    pub width: usize,
}

/// A release version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<Prerelease>,
}

/// Which component an increment bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionType {
    Major,
    Minor,
    Patch,
}

impl FromStr for VersionType {
    type Err = ReleaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "major" => Ok(VersionType::Major),
            "minor" => Ok(VersionType::Minor),
            "patch" => Ok(VersionType::Patch),
            other => Err(ReleaseError::InvalidVersionType(other.to_string())),
        }
    }
}

impl Version {
    /// `v0.0.0`, the version of a repository with no release tags.
    pub fn zero() -> Self {
        Self {
            major: 0,
            minor: 0,
            patch: 0,
            prerelease: None,
        }
    }

    /// The version without its prerelease suffix.
    pub fn base(&self) -> Version {
        Version {
            prerelease: None,
            ..self.clone()
        }
    }

    /// Bump one component, clearing lower components and any prerelease.
    pub fn increment(&self, version_type: VersionType) -> Version {
        let (major, minor, patch) = match version_type {
            VersionType::Major => (self.major + 1, 0, 0),
            VersionType::Minor => (self.major, self.minor + 1, 0),
            VersionType::Patch => (self.major, self.minor, self.patch + 1),
        };
        Version {
            major,
            minor,
            patch,
            prerelease: None,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(prerelease) = &self.prerelease {
            write!(
                f,
                "-prerelease{:0width$}",
                prerelease.number,
                width = prerelease.width
            )?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = ReleaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ReleaseError::InvalidVersion(s.to_string());

        let rest = s.strip_prefix('v').ok_or_else(invalid)?;
        let (numbers, prerelease) = match rest.split_once('-') {
            Some((numbers, suffix)) => {
                let digits = suffix.strip_prefix("prerelease").ok_or_else(invalid)?;
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                let number: u32 = digits.parse().map_err(|_| invalid())?;
                (
                    numbers,
                    Some(Prerelease {
                        number,
                        width: digits.len(),
                    }),
                )
            }
            None => (rest, None),
        };

        let mut parts = numbers.split('.');
        let mut component = || -> Result<u64, ReleaseError> {
            let part = parts.next().ok_or_else(invalid)?;
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse().map_err(|_| invalid())
        };
        let major = component()?;
        let minor = component()?;
        let patch = component()?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Version {
            major,
            minor,
            patch,
            prerelease,
        })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                // A release outranks any of its prereleases.
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.number.cmp(&b.number),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ensure a version string carries the `v` prefix and parses.
pub fn normalize(s: &str) -> Result<Version, ReleaseError> {
    if s.starts_with('v') {
        s.parse()
    } else {
        format!("v{s}").parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display_round_trip() {
        for raw in ["v1.2.3", "v0.0.1", "v10.20.30", "v1.2.3-prerelease04"] {
            let version: Version = raw.parse().unwrap();
            assert_eq!(version.to_string(), raw);
        }
    }

    #[test]
    fn test_parse_preserves_prerelease_width() {
        let version: Version = "v1.2.3-prerelease7".parse().unwrap();
        let prerelease = version.prerelease.unwrap();
        assert_eq!(prerelease.number, 7);
        assert_eq!(prerelease.width, 1);

        let version: Version = "v1.2.3-prerelease07".parse().unwrap();
        let prerelease = version.prerelease.unwrap();
        assert_eq!(prerelease.number, 7);
        assert_eq!(prerelease.width, 2);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for raw in [
            "1.2.3",
            "v1.2",
            "v1.2.3.4",
            "v1.2.x",
            "v1.2.3-rc1",
            "v1.2.3-prerelease",
            "v1.2.3-prereleaseXY",
            "",
        ] {
            assert!(raw.parse::<Version>().is_err(), "{raw} should not parse");
        }
    }

    #[test]
    fn test_ordering() {
        let v1: Version = "v1.2.3".parse().unwrap();
        let v2: Version = "v1.2.4".parse().unwrap();
        let pre1: Version = "v1.2.4-prerelease01".parse().unwrap();
        let pre2: Version = "v1.2.4-prerelease02".parse().unwrap();

        assert!(v1 < pre1);
        assert!(pre1 < pre2);
        assert!(pre2 < v2);
    }

    #[test]
    fn test_increment() {
        let version: Version = "v1.2.3-prerelease05".parse().unwrap();
        assert_eq!(version.increment(VersionType::Major).to_string(), "v2.0.0");
        assert_eq!(version.increment(VersionType::Minor).to_string(), "v1.3.0");
        assert_eq!(version.increment(VersionType::Patch).to_string(), "v1.2.4");
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("1.2.3").unwrap().to_string(), "v1.2.3");
        assert_eq!(normalize("v1.2.3").unwrap().to_string(), "v1.2.3");
        assert!(normalize("bogus").is_err());
    }
}
