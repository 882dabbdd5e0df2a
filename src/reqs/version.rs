//! Tolerant tool version parsing and comparison
//!
//! Tool output rarely carries clean semver: `v20.11.1`, `Python 3.12.1`,
//! `go1.22.1`, sometimes just `1.10`. Parsing takes the leading numeric
//! dot-segments, pads to three, and compares through `semver`.

use std::cmp::Ordering;

use regex::Regex;
use semver::Version;

/// Parse a tolerant version string into a comparable form
pub fn parse(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches(['v', 'V']);

    let pattern = Regex::new(r"^(\d+)(?:\.(\d+))?(?:\.(\d+))?").expect("static regex");
    let captures = pattern.captures(raw)?;

    let segment = |idx: usize| -> u64 {
        captures
            .get(idx)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    };

    Some(Version::new(segment(1), segment(2), segment(3)))
}

/// Compare two tolerant version strings; `None` when either is unparseable
pub fn compare(a: &str, b: &str) -> Option<Ordering> {
    Some(parse(a)?.cmp(&parse(b)?))
}

/// Whether `found` satisfies `minimum`
pub fn satisfies(found: &str, minimum: &str) -> bool {
    matches!(
        compare(found, minimum),
        Some(Ordering::Greater) | Some(Ordering::Equal)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal() {
        assert_eq!(compare("1.2.3", "1.2.3"), Some(Ordering::Equal));
    }

    #[test]
    fn test_numeric_not_lexicographic() {
        assert_eq!(compare("1.10.0", "1.9.0"), Some(Ordering::Greater));
        assert_eq!(compare("1.9.0", "1.10.0"), Some(Ordering::Less));
    }

    #[test]
    fn test_ordering_properties() {
        let versions = ["1.2.3", "1.10.0", "2.0.0", "0.9.1"];

        // Reflexive
        for v in versions {
            assert_eq!(compare(v, v), Some(Ordering::Equal));
        }

        // Antisymmetric
        for a in versions {
            for b in versions {
                let forward = compare(a, b).unwrap();
                let backward = compare(b, a).unwrap();
                assert_eq!(forward, backward.reverse());
            }
        }

        // Transitive over a sorted chain
        assert_eq!(compare("0.9.1", "1.2.3"), Some(Ordering::Less));
        assert_eq!(compare("1.2.3", "2.0.0"), Some(Ordering::Less));
        assert_eq!(compare("0.9.1", "2.0.0"), Some(Ordering::Less));
    }

    #[test]
    fn test_tolerant_forms() {
        assert_eq!(compare("v20.11.1", "20.11.1"), Some(Ordering::Equal));
        assert_eq!(compare("1.10", "1.10.0"), Some(Ordering::Equal));
        assert_eq!(compare("3", "3.0.0"), Some(Ordering::Equal));
        assert_eq!(compare("1.22.1 linux/amd64", "1.22.0"), Some(Ordering::Greater));
    }

    #[test]
    fn test_unparseable() {
        assert_eq!(compare("latest", "1.0.0"), None);
        assert!(!satisfies("garbage", "1.0.0"));
    }

    #[test]
    fn test_satisfies() {
        assert!(satisfies("18.19.0", "18.0.0"));
        assert!(satisfies("18.0.0", "18.0.0"));
        assert!(!satisfies("16.20.2", "18.0.0"));
    }
}
