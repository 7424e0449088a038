//! Version Comparator
//!
//! Strict `MAJOR.MINOR.PATCH` versions and the six constraint operators
//! used in dependency references.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{PlugError, Result};

/// A plugin version, ordered numerically component by component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a version of the exact form `<uint>.<uint>.<uint>`
    pub fn parse(input: &str) -> Result<Self> {
        let parts: Vec<&str> = input.split('.').collect();
        if parts.len() != 3 {
            return Err(parse_error(input, "expected MAJOR.MINOR.PATCH"));
        }

        let mut numbers = [0u64; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(parse_error(input, "components must be unsigned integers"));
            }
            *slot = part
                .parse()
                .map_err(|_| parse_error(input, "component out of range"))?;
        }

        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }
}

fn parse_error(input: &str, reason: &str) -> PlugError {
    PlugError::Parse {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = PlugError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Compare two versions by (MAJOR, MINOR, PATCH) as integers
pub fn compare(a: &Version, b: &Version) -> Ordering {
    a.cmp(b)
}

/// Comparison operator of a dependency constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Ge,
    Gt,
    Le,
    Lt,
    Eq,
    /// Unconstrained
    Any,
}

impl Operator {
    /// Operators in the order they must be tried when scanning a reference,
    /// two-character forms first.
    pub(crate) const SCAN_ORDER: [(&'static str, Operator); 5] = [
        (">=", Operator::Ge),
        ("<=", Operator::Le),
        ("==", Operator::Eq),
        (">", Operator::Gt),
        ("<", Operator::Lt),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ge => ">=",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Lt => "<",
            Self::Eq => "==",
            Self::Any => "*",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `version` satisfies `operator bound`; an absent bound always does
pub fn satisfies(version: &Version, operator: Operator, bound: Option<&Version>) -> bool {
    let Some(bound) = bound else {
        return true;
    };

    let ordering = compare(version, bound);
    match operator {
        Operator::Any => true,
        Operator::Ge => ordering != Ordering::Less,
        Operator::Gt => ordering == Ordering::Greater,
        Operator::Le => ordering != Ordering::Greater,
        Operator::Lt => ordering == Ordering::Less,
        Operator::Eq => ordering == Ordering::Equal,
    }
}

/// An operator paired with its bound, e.g. `>=1.2.0`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Constraint {
    pub operator: Operator,
    pub bound: Option<Version>,
}

impl Constraint {
    pub const ANY: Constraint = Constraint {
        operator: Operator::Any,
        bound: None,
    };

    pub fn new(operator: Operator, bound: Version) -> Self {
        Self {
            operator,
            bound: Some(bound),
        }
    }

    pub fn is_any(&self) -> bool {
        self.operator == Operator::Any || self.bound.is_none()
    }

    pub fn matches(&self, version: &Version) -> bool {
        satisfies(version, self.operator, self.bound.as_ref())
    }

    /// Parse `*`, an empty string, or `<op><version>` (whitespace allowed)
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed == "*" {
            return Ok(Self::ANY);
        }

        for (token, operator) in Operator::SCAN_ORDER {
            if let Some(rest) = trimmed.strip_prefix(token) {
                let bound = Version::parse(rest.trim())?;
                return Ok(Self::new(operator, bound));
            }
        }

        Err(parse_error(input, "constraint must start with >=, >, <=, < or =="))
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bound {
            Some(bound) if self.operator != Operator::Any => {
                write!(f, "{}{}", self.operator, bound)
            }
            _ => f.write_str("*"),
        }
    }
}
