use once_cell::sync;
use regex::Regex;

/// Producer prefix the Go compiler stamps into every compile unit.
pub const GO_PRODUCER_PREFIX: &str = "Go cmd/compile ";

/// Go toolchain SemVer version.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub struct GoVersion(pub (u32, u32, u32));

impl GoVersion {
    /// Parse a version from strings like "go1.11.2", "go1.11" or
    /// "devel +6fd1a2d 2018-09-01" (development builds parse to `None`).
    pub fn parse(s: &str) -> Option<Self> {
        static V_RE: sync::Lazy<Regex> = sync::Lazy::new(|| {
            Regex::new(r"^go(\d+)\.(\d+)(?:\.(\d+))?").expect("must compile")
        });

        let caps = V_RE.captures(s.trim())?;
        let major = caps.get(1)?.as_str().parse().ok()?;
        let minor = caps.get(2)?.as_str().parse().ok()?;
        let patch = caps
            .get(3)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        Some(GoVersion((major, minor, patch)))
    }

    /// Parse a version from the DWARF producer string of a compile unit.
    pub fn from_producer(producer: &str) -> Option<Self> {
        let rest = producer.strip_prefix(GO_PRODUCER_PREFIX)?;
        Self::parse(rest)
    }
}

impl Default for GoVersion {
    fn default() -> Self {
        // the most recent supported version is assumed when detection fails
        // (development builds follow the tip layouts)
        GoVersion((1, 11, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(GoVersion::parse("go1.11.2"), Some(GoVersion((1, 11, 2))));
        assert_eq!(GoVersion::parse("go1.10"), Some(GoVersion((1, 10, 0))));
        assert_eq!(GoVersion::parse("devel +6fd1a2d Sat Sep 1"), None);
        assert_eq!(GoVersion::parse(""), None);
    }

    #[test]
    fn test_from_producer() {
        assert_eq!(
            GoVersion::from_producer("Go cmd/compile go1.11"),
            Some(GoVersion((1, 11, 0)))
        );
        assert_eq!(GoVersion::from_producer("GNU C 7.3.0"), None);
    }

    #[test]
    fn test_ordering() {
        assert!(GoVersion((1, 11, 0)) > GoVersion((1, 10, 8)));
        assert!(GoVersion((1, 10, 1)) > GoVersion((1, 10, 0)));
        assert!(GoVersion((2, 0, 0)) > GoVersion((1, 99, 99)));
    }
}
