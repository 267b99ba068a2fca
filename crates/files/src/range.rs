//! HTTP-style byte range parsing.

use std::fmt;
use std::str::FromStr;

use crate::error::FileError;

/// A single requested byte range, before it is resolved against a length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=a-b`, both ends inclusive.
    Bounded { start: u64, end: u64 },
    /// `bytes=a-`
    From { start: u64 },
    /// `bytes=-n`, the last `n` bytes.
    Suffix { len: u64 },
}

/// A resolved, satisfiable range: `start..=end` within the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// The whole object. `None` for empty objects, which have no bytes to address.
    pub fn full(total_len: u64) -> Option<Self> {
        (total_len > 0).then(|| Self {
            start: 0,
            end: total_len - 1,
        })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// `Content-Range` header value.
    pub fn content_range(&self, total_len: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total_len)
    }
}

impl RangeSpec {
    /// Parse a `Range` header value. Only single ranges in byte units are accepted.
    pub fn parse(header: &str) -> Result<Self, FileError> {
        let spec = header
            .trim()
            .strip_prefix("bytes=")
            .ok_or_else(|| FileError::InvalidRange(format!("unsupported range unit: {header}")))?;
        if spec.contains(',') {
            return Err(FileError::InvalidRange(
                "multiple ranges are not supported".to_string(),
            ));
        }
        let (first, last) = spec
            .split_once('-')
            .ok_or_else(|| FileError::InvalidRange(format!("malformed range: {header}")))?;
        let (first, last) = (first.trim(), last.trim());

        match (first.is_empty(), last.is_empty()) {
            (true, true) => Err(FileError::InvalidRange(format!("malformed range: {header}"))),
            (true, false) => Ok(Self::Suffix {
                len: parse_offset(last)?,
            }),
            (false, true) => Ok(Self::From {
                start: parse_offset(first)?,
            }),
            (false, false) => {
                let start = parse_offset(first)?;
                let end = parse_offset(last)?;
                if end < start {
                    return Err(FileError::InvalidRange(format!(
                        "range end {end} precedes start {start}"
                    )));
                }
                Ok(Self::Bounded { start, end })
            }
        }
    }

    /// Resolve against an object of `total_len` bytes.
    ///
    /// An end beyond the object is clamped; a start beyond it is unsatisfiable.
    pub fn resolve(&self, total_len: u64) -> Result<ByteRange, FileError> {
        let unsatisfiable =
            || FileError::InvalidRange(format!("range not satisfiable for {total_len} bytes"));
        if total_len == 0 {
            return Err(unsatisfiable());
        }
        let last = total_len - 1;
        match *self {
            Self::Bounded { start, end } => {
                if start > last {
                    return Err(unsatisfiable());
                }
                Ok(ByteRange {
                    start,
                    end: end.min(last),
                })
            }
            Self::From { start } => {
                if start > last {
                    return Err(unsatisfiable());
                }
                Ok(ByteRange { start, end: last })
            }
            Self::Suffix { len } => {
                if len == 0 {
                    return Err(unsatisfiable());
                }
                Ok(ByteRange {
                    start: total_len.saturating_sub(len),
                    end: last,
                })
            }
        }
    }
}

impl fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bounded { start, end } => write!(f, "bytes={start}-{end}"),
            Self::From { start } => write!(f, "bytes={start}-"),
            Self::Suffix { len } => write!(f, "bytes=-{len}"),
        }
    }
}

impl FromStr for RangeSpec {
    type Err = FileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_offset(raw: &str) -> Result<u64, FileError> {
    raw.parse::<u64>()
        .map_err(|_| FileError::InvalidRange(format!("invalid byte offset: {raw}")))
}
