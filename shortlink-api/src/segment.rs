/// Route segments: the public key of a short URL
use serde::{Deserialize, Serialize};
use shortlink_core::{EntityKey, Error, Result};
use std::fmt;
use std::str::FromStr;

/// Length of generated segments
pub const SEGMENT_LEN: usize = 8;

/// Longest segment accepted from a caller
pub const MAX_SEGMENT_LEN: usize = 64;

const ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B',
    'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U',
    'V', 'W', 'X', 'Y', 'Z',
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteSegment(String);

impl RouteSegment {
    /// Random alphanumeric segment of `SEGMENT_LEN` characters
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(SEGMENT_LEN, &ALPHABET))
    }

    /// Validate a caller-supplied segment: non-empty, at most
    /// `MAX_SEGMENT_LEN` characters, only `[A-Za-z0-9_-]`
    pub fn parse(segment: &str) -> Result<Self> {
        if segment.is_empty() {
            return Err(Error::InvalidArgument("route segment is empty".to_string()));
        }
        if segment.len() > MAX_SEGMENT_LEN {
            return Err(Error::InvalidArgument(format!(
                "route segment longer than {} characters",
                MAX_SEGMENT_LEN
            )));
        }
        if let Some(bad) = segment
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(Error::InvalidArgument(format!(
                "route segment contains {:?}",
                bad
            )));
        }
        Ok(Self(segment.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RouteSegment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<&RouteSegment> for EntityKey {
    fn from(segment: &RouteSegment) -> Self {
        EntityKey::new(segment.0.clone())
    }
}

impl From<RouteSegment> for EntityKey {
    fn from(segment: RouteSegment) -> Self {
        EntityKey::new(segment.0)
    }
}
