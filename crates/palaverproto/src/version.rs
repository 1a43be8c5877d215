//! Version compatibility between hub and clients.
//!
//! Hub and client exchange semantic version strings at registration.
//! Equal major means compatible; minor or patch drift is reported but never
//! fatal. Unparseable versions are treated as maximal drift and logged, not
//! rejected.

use serde::{Deserialize, Serialize};

/// The protocol version this build speaks.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result of comparing two version strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compat {
    /// Identical versions.
    Same,
    /// Equal major and minor, differing patch. Fully compatible, warn.
    PatchDrift,
    /// Equal major, differing minor. Compatible.
    MinorDrift,
    /// Differing major, or unparseable. Reported, never fatal.
    Incompatible,
}

impl Compat {
    /// Compare two semantic version strings.
    pub fn check(ours: &str, theirs: &str) -> Compat {
        let (Some(a), Some(b)) = (parse(ours), parse(theirs)) else {
            return Compat::Incompatible;
        };
        if a.0 != b.0 {
            Compat::Incompatible
        } else if a.1 != b.1 {
            Compat::MinorDrift
        } else if a.2 != b.2 {
            Compat::PatchDrift
        } else {
            Compat::Same
        }
    }

    pub fn is_compatible(&self) -> bool {
        !matches!(self, Compat::Incompatible)
    }
}

/// Lenient `major.minor.patch` parse. Pre-release/build suffixes on the
/// patch component are ignored ("1.2.3-rc1" parses as (1, 2, 3)).
fn parse(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.trim().splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts
        .next()
        .map(|p| {
            p.split(|c: char| c == '-' || c == '+')
                .next()
                .unwrap_or("0")
                .parse()
                .unwrap_or(0)
        })
        .unwrap_or(0);
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drift_classification() {
        assert_eq!(Compat::check("1.2.3", "1.2.3"), Compat::Same);
        assert_eq!(Compat::check("1.2.3", "1.2.9"), Compat::PatchDrift);
        assert_eq!(Compat::check("1.2.3", "1.5.0"), Compat::MinorDrift);
        assert_eq!(Compat::check("1.2.3", "2.0.0"), Compat::Incompatible);
    }

    #[test]
    fn lenient_parsing() {
        assert_eq!(Compat::check("1.2", "1.2.0"), Compat::Same);
        assert_eq!(Compat::check("1.2.3-rc1", "1.2.3"), Compat::Same);
        assert_eq!(Compat::check("garbage", "1.2.3"), Compat::Incompatible);
    }

    #[test]
    fn incompatible_is_reported_not_fatal() {
        assert!(!Compat::check("1.0.0", "2.0.0").is_compatible());
        assert!(Compat::check("1.0.0", "1.9.9").is_compatible());
    }
}
