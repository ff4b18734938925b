//! Template versions.
//!
//! Versions are dotted numeric strings (`0.5`, `1.2.3`). Comparison pads the
//! shorter version with zeros, so `1.0` and `1` are equal and `0.10 > 0.9`.

use crate::error::{SequencerError, SequencerResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A parsed template version. Keeps the original text for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TemplateVersion {
    parts: Vec<u64>,
    raw: String,
}

impl TemplateVersion {
    pub fn parse(text: &str) -> SequencerResult<Self> {
        let trimmed = text.trim();
        let numeric = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if numeric.is_empty() {
            return Err(SequencerError::validation("templateVersion is empty"));
        }

        let parts = numeric
            .split('.')
            .map(|part| part.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| {
                SequencerError::validation(format!(
                    "templateVersion '{trimmed}' is not a dotted numeric version"
                ))
            })?;

        Ok(Self {
            parts,
            raw: trimmed.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for TemplateVersion {
    type Err = SequencerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TemplateVersion {
    type Error = SequencerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TemplateVersion> for String {
    fn from(version: TemplateVersion) -> Self {
        version.raw
    }
}

impl fmt::Display for TemplateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Ord for TemplateVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        (0..len)
            .map(|i| {
                let a = self.parts.get(i).copied().unwrap_or(0);
                let b = other.parts.get(i).copied().unwrap_or(0);
                a.cmp(&b)
            })
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for TemplateVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TemplateVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TemplateVersion {}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> TemplateVersion {
        s.parse().unwrap()
    }

    #[test]
    fn test_version_ordering() {
        assert!(v("0.5") > v("0.3"));
        assert!(v("0.10") > v("0.9"));
        assert!(v("1.2.3") > v("1.2"));
        assert_eq!(v("1.0"), v("1"));
        assert_eq!(v("v2.1"), v("2.1"));
    }

    #[test]
    fn test_invalid_versions() {
        assert!(TemplateVersion::parse("").is_err());
        assert!(TemplateVersion::parse("1.x").is_err());
        assert!(TemplateVersion::parse("1..2").is_err());
    }

    #[test]
    fn test_keeps_original_text() {
        let version = v(" 0.5 ");
        assert_eq!(version.as_str(), "0.5");
        assert_eq!(String::from(version), "0.5");
    }
}
