//! Backend version model and parsing.
//!
//! Odoo reports its version in several shapes depending on protocol and
//! deployment: a five-element tuple over XML-RPC, plain `N.N` strings,
//! datestamped builds (`17.0-20240801`), enterprise markers (`17.0e`) and
//! SaaS forms (`saas-17.2`, `saas~17.2`). The parser accepts all of them.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Server edition as far as it can be determined.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edition {
    Community,
    Enterprise,
    #[default]
    Unknown,
}

impl fmt::Display for Edition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edition::Community => write!(f, "community"),
            Edition::Enterprise => write!(f, "enterprise"),
            Edition::Unknown => write!(f, "unknown"),
        }
    }
}

/// Detected backend version. Immutable for the lifetime of a connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OdooVersion {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
    /// Release level, e.g. `final`, `alpha`
    pub level: String,
    pub serial: u32,
    /// The raw string the backend reported
    pub full_string: String,
    pub edition: Edition,
}

impl OdooVersion {
    pub fn new(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor,
            micro: 0,
            level: "final".to_string(),
            serial: 0,
            full_string: format!("{}.{}", major, minor),
            edition: Edition::Unknown,
        }
    }

    pub fn with_edition(mut self, edition: Edition) -> Self {
        self.edition = edition;
        self
    }

    /// Parse the five-element tuple form `[major, minor, micro, level, serial]`.
    pub fn from_tuple(parts: &[serde_json::Value]) -> Option<Self> {
        let major = parts.first()?.as_u64()? as u32;
        let minor = parts.get(1).and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        let micro = parts.get(2).and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        let level = parts
            .get(3)
            .and_then(|v| v.as_str())
            .unwrap_or("final")
            .to_string();
        let serial = parts.get(4).and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        Some(Self {
            major,
            minor,
            micro,
            level,
            serial,
            full_string: format!("{}.{}", major, minor),
            edition: Edition::Unknown,
        })
    }

    /// Parse a version string in any of the accepted grammars.
    ///
    /// Returns `None` when no leading `major.minor` pair can be found.
    pub fn parse(raw: &str) -> Option<Self> {
        static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"^(?:saas[-~])?(\d+)\.(\d+)(?:\.(\d+))?(e)?(?:-(\S+))?$")
                .unwrap_or_else(|e| panic!("invalid version regex: {e}"))
        });

        let trimmed = raw.trim();
        let caps = VERSION_RE.captures(trimmed)?;
        let major: u32 = caps.get(1)?.as_str().parse().ok()?;
        let minor: u32 = caps.get(2)?.as_str().parse().ok()?;
        let micro: u32 = caps
            .get(3)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        let edition = if caps.get(4).is_some() {
            Edition::Enterprise
        } else {
            Edition::Unknown
        };

        Some(Self {
            major,
            minor,
            micro,
            level: "final".to_string(),
            serial: 0,
            full_string: trimmed.to_string(),
            edition,
        })
    }

    /// Canonical `major.minor` form; the enterprise marker round-trips.
    pub fn short(&self) -> String {
        if self.edition == Edition::Enterprise {
            format!("{}.{}e", self.major, self.minor)
        } else {
            format!("{}.{}", self.major, self.minor)
        }
    }
}

impl fmt::Display for OdooVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.full_string, self.edition)
    }
}
