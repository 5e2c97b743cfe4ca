//! Log sequence number arithmetic
//!
//! Position tokens for the log backend are 64-bit unsigned integers
//! serialized as `HI/LO` uppercase hex, each half without leading zeros:
//! the textual form PostgreSQL itself uses (`pg_lsn`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;
use std::str::FromStr;

/// A position in the upstream write-ahead log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Lsn(pub u64);

impl Lsn {
    /// The zero position; `START_REPLICATION` from here defers to the
    /// slot's own restart point.
    pub const ZERO: Lsn = Lsn(0);

    /// The position one byte past this one.
    pub fn next(self) -> Lsn {
        Lsn(self.0.saturating_add(1))
    }

    /// Advance by a byte count.
    pub fn add_bytes(self, bytes: u64) -> Lsn {
        Lsn(self.0.saturating_add(bytes))
    }

    /// High 32 bits (the segment half of the textual form).
    pub fn hi(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Low 32 bits.
    pub fn lo(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.hi(), self.lo())
    }
}

/// Error parsing an `HI/LO` token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid LSN: {0}")]
pub struct ParseLsnError(pub String);

impl FromStr for Lsn {
    type Err = ParseLsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s.split_once('/').ok_or_else(|| ParseLsnError(s.into()))?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| ParseLsnError(s.into()))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| ParseLsnError(s.into()))?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

impl TryFrom<String> for Lsn {
    type Error = ParseLsnError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Lsn> for String {
    fn from(lsn: Lsn) -> String {
        lsn.to_string()
    }
}

impl From<u64> for Lsn {
    fn from(v: u64) -> Self {
        Lsn(v)
    }
}

impl Add<u64> for Lsn {
    type Output = Lsn;

    fn add(self, rhs: u64) -> Lsn {
        self.add_bytes(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format_roundtrip() {
        for s in ["0/0", "0/1A2B3C", "16/B374D848", "FFFFFFFF/FFFFFFFF"] {
            let lsn: Lsn = s.parse().unwrap();
            assert_eq!(lsn.to_string(), s);
        }
    }

    #[test]
    fn test_no_leading_zeros() {
        assert_eq!(Lsn(0x0000_0001_0000_00AB).to_string(), "1/AB");
        assert_eq!(Lsn(0xAB).to_string(), "0/AB");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Lsn>().is_err());
        assert!("1A2B3C".parse::<Lsn>().is_err());
        assert!("0/XYZ".parse::<Lsn>().is_err());
        assert!("0/1/2".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_ordering_and_arithmetic() {
        let a: Lsn = "0/10".parse().unwrap();
        let b: Lsn = "1/0".parse().unwrap();
        assert!(a < b);
        assert_eq!(a.next(), Lsn(0x11));
        assert_eq!(a + 0x10, Lsn(0x20));
        assert_eq!(a.add_bytes(0xFFFF_FFF0), Lsn(0x1_0000_0000));
    }

    #[test]
    fn test_serde_as_string() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        let json = serde_json::to_string(&lsn).unwrap();
        assert_eq!(json, "\"16/B374D848\"");
        let back: Lsn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lsn);
    }
}
