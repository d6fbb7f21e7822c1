// ABOUTME: Replication stream positions
// ABOUTME: Totally ordered u64 tokens with PostgreSQL LSN parsing and formatting

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A point in the source's change history.
///
/// PostgreSQL LSNs (`16/B374D848`) map to `(segment << 32) | offset`, which keeps
/// the ordering of the original values.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Position(pub u64);

impl Position {
    pub const ZERO: Position = Position(0);

    pub fn new(value: u64) -> Self {
        Position(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Position(self.0 + 1)
    }

    /// Parse a PostgreSQL LSN in `X/Y` hexadecimal notation.
    pub fn from_lsn(lsn: &str) -> Result<Self> {
        let (segment, offset) = lsn
            .trim()
            .split_once('/')
            .with_context(|| format!("Invalid LSN '{}': expected X/Y", lsn))?;
        let segment = u64::from_str_radix(segment, 16)
            .with_context(|| format!("Invalid LSN segment in '{}'", lsn))?;
        let offset = u64::from_str_radix(offset, 16)
            .with_context(|| format!("Invalid LSN offset in '{}'", lsn))?;
        if segment > u32::MAX as u64 || offset > u32::MAX as u64 {
            bail!("LSN '{}' is out of range", lsn);
        }
        Ok(Position((segment << 32) | offset))
    }

    /// Render as a PostgreSQL LSN.
    pub fn to_lsn(self) -> String {
        format!("{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_lsn())
    }
}

impl FromStr for Position {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.contains('/') {
            Position::from_lsn(s)
        } else {
            let value = s
                .trim()
                .parse::<u64>()
                .with_context(|| format!("Invalid position '{}'", s))?;
            Ok(Position(value))
        }
    }
}

impl From<u64> for Position {
    fn from(value: u64) -> Self {
        Position(value)
    }
}
