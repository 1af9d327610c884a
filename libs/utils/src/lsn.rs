//! Log sequence number (LSN) — a 64-bit byte offset into the WAL stream.
//!
//! Mirrors PostgreSQL's `XLogRecPtr`/`pg_lsn` formatting: `%X/%X` of the high
//! and low 32-bit halves, e.g. `0/16B2150`.

use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self != Lsn::INVALID
    }

    pub fn checked_sub<T: Into<u64>>(self, other: T) -> Option<Lsn> {
        self.0.checked_sub(other.into()).map(Lsn)
    }

    /// Align this LSN down to the start of its containing `segment_size` WAL segment.
    pub fn segment_lsn(self, segment_size: u64) -> Lsn {
        Lsn(self.0 - (self.0 % segment_size))
    }

    /// 0-based WAL segment number this LSN falls into, given the segment size in bytes.
    pub fn segment_number(self, segment_size: u64) -> u64 {
        self.0 / segment_size
    }
}

impl From<u64> for Lsn {
    fn from(n: u64) -> Self {
        Lsn(n)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xffff_ffff)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid LSN literal: {0:?}")]
pub struct LsnParseError(String);

impl FromStr for Lsn {
    type Err = LsnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s.split_once('/').ok_or_else(|| LsnParseError(s.to_string()))?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| LsnParseError(s.to_string()))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| LsnParseError(s.to_string()))?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}
