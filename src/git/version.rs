use std::fmt;

/// Version information for git
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub raw: String,
}

impl GitVersion {
    /// Parse a version string like "git version 2.39.2" or
    /// "git version 2.39.2 (Apple Git-143)" or "git version 2.45.1.windows.1"
    pub fn parse(version_str: &str) -> Option<Self> {
        let version_part = version_str
            .trim()
            .strip_prefix("git version ")?
            .split_whitespace()
            .next()?;

        let mut version_nums = version_part.split('.');
        let major: u32 = version_nums.next()?.parse().ok()?;
        let minor: u32 = version_nums.next().unwrap_or("0").parse().unwrap_or(0);
        let patch: u32 = version_nums
            .next()
            .map(|p| p.chars().take_while(char::is_ascii_digit).collect::<String>())
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);

        Some(Self {
            major,
            minor,
            patch,
            raw: version_str.trim().to_string(),
        })
    }

    /// Check if this version meets the minimum requirement
    pub fn meets_minimum(&self, min_major: u32, min_minor: u32) -> bool {
        self.major > min_major || (self.major == min_major && self.minor >= min_minor)
    }
}

impl fmt::Display for GitVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
