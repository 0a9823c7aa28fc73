//! Dotted numeric version ordering.
//!
//! `1.10.0 > 1.9.9`, trailing zero components are insignificant (`1.2 == 1.2.0`),
//! an optional leading `v` is accepted. Anything else is malformed and sorts
//! below every well-formed version so that a broken local marker always
//! triggers an update attempt.

use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone)]
pub enum Version {
    Malformed(String),
    Release(Vec<u64>),
}

impl Version {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let digits = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if digits.is_empty() {
            return Version::Malformed(raw.to_string());
        }
        let mut parts = Vec::new();
        for part in digits.split('.') {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Version::Malformed(raw.to_string());
            }
            match part.parse::<u64>() {
                Ok(n) => parts.push(n),
                Err(_) => return Version::Malformed(raw.to_string()),
            }
        }
        while parts.len() > 1 && parts.last() == Some(&0) {
            parts.pop();
        }
        Version::Release(parts)
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Version::Malformed(_))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Version::Release(a), Version::Release(b)) => a.cmp(b),
            (Version::Malformed(_), Version::Release(_)) => Ordering::Less,
            (Version::Release(_), Version::Malformed(_)) => Ordering::Greater,
            (Version::Malformed(a), Version::Malformed(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Malformed(raw) => write!(f, "{raw}"),
            Version::Release(parts) => {
                let joined: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                write!(f, "{}", joined.join("."))
            }
        }
    }
}

/// Decide whether the remote version should replace the local one.
/// A missing or malformed local marker always asks for an update; identical
/// strings never do.
pub fn needs_update(local: Option<&str>, remote: &str) -> bool {
    let Some(local) = local else {
        return true;
    };
    if local.trim() == remote.trim() {
        return false;
    }
    let local = Version::parse(local);
    if local.is_malformed() {
        return true;
    }
    Version::parse(remote) > local
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_not_lexicographic() {
        assert!(Version::parse("1.10.0") > Version::parse("1.9.9"));
        assert!(Version::parse("2.0") > Version::parse("1.99.99"));
        assert!(Version::parse("0.0.1") < Version::parse("0.1"));
    }

    #[test]
    fn trailing_zeros_and_prefix() {
        assert_eq!(Version::parse("1.2"), Version::parse("1.2.0"));
        assert_eq!(Version::parse("v3.1"), Version::parse("3.1.0.0"));
        assert_eq!(Version::parse(" 4.0 ").to_string(), "4");
    }

    #[test]
    fn malformed_is_older_than_everything() {
        for bad in ["", "abc", "1..2", "1.2-beta", "1.x", ".1", "v"] {
            let bad = Version::parse(bad);
            assert!(bad.is_malformed());
            assert!(bad < Version::parse("0"));
            assert!(bad < Version::parse("0.0.1"));
        }
    }

    #[test]
    fn ordering_is_total_and_consistent() {
        let samples = [
            "0", "0.1", "1", "1.0.1", "1.2", "1.10", "1.9.9", "10", "junk", "zzz", "1.2-rc",
        ];
        let parsed: Vec<Version> = samples.iter().map(|s| Version::parse(s)).collect();
        for a in &parsed {
            for b in &parsed {
                let ab = a.cmp(b);
                assert_eq!(ab, b.cmp(a).reverse(), "antisymmetry {a} {b}");
                for c in &parsed {
                    if a < b && b < c {
                        assert!(a < c, "transitivity {a} {b} {c}");
                    }
                }
            }
        }
    }

    #[test]
    fn update_decision() {
        assert!(needs_update(None, "1.0.0"));
        assert!(needs_update(Some("1.0.0"), "1.2.0"));
        assert!(!needs_update(Some("1.2.0"), "1.2.0"));
        assert!(!needs_update(Some("1.3"), "1.2.9"));
        assert!(needs_update(Some("garbage"), "1.0"));
        assert!(!needs_update(Some("garbage"), "garbage"));
        assert!(!needs_update(Some("1.0"), "not-a-version"));
    }
}
