//! PostgreSQL Log Sequence Numbers.
//!
//! An LSN is a position in the write-ahead log, rendered by Postgres as two
//! hexadecimal segments separated by a slash, e.g. `16/B374D848`. Both
//! segments are base-16 (the teacher's `slot::Lsn` parses the first segment
//! as base-10, which is the bug this module exists to not repeat).

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid LSN: \"{0}\"")]
    InvalidLsn(String),
}

/// A PostgreSQL LSN, `(major, minor)`, compared lexicographically.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn {
    major: u32,
    minor: u32,
}

impl Lsn {
    /// The sentinel "never seen" LSN. Strictly less than any non-zero LSN.
    pub const ZERO: Lsn = Lsn { major: 0, minor: 0 };

    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Parse a `MAJOR/MINOR` hexadecimal LSN string.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let (major, minor) = s.split_once('/').ok_or_else(|| Error::InvalidLsn(s.to_string()))?;

        if major.is_empty()
            || minor.is_empty()
            || !major.chars().all(|c| c.is_ascii_hexdigit())
            || !minor.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(Error::InvalidLsn(s.to_string()));
        }

        let major = u32::from_str_radix(major, 16).map_err(|_| Error::InvalidLsn(s.to_string()))?;
        let minor = u32::from_str_radix(minor, 16).map_err(|_| Error::InvalidLsn(s.to_string()))?;

        Ok(Self { major, minor })
    }

    /// Total order comparison, returning -1/0/1 to mirror the spec's contract.
    pub fn compare(a: &Lsn, b: &Lsn) -> i32 {
        match a.cmp(b) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.major == 0 && self.minor == 0
    }

    /// Combine the two 32-bit halves into a single 64-bit monotonic value,
    /// convenient as a sort/index key.
    pub fn as_u64(&self) -> u64 {
        (u64::from(self.major) << 32) | u64::from(self.minor)
    }

    pub fn from_u64(value: u64) -> Self {
        Self {
            major: (value >> 32) as u32,
            minor: value as u32,
        }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.major, self.minor)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Lsn {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Lsn::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_basic() {
        let lsn = Lsn::parse("16/B374D848").unwrap();
        assert_eq!(lsn.major(), 0x16);
        assert_eq!(lsn.minor(), 0xB374D848);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(Lsn::parse("not-an-lsn").is_err());
        assert!(Lsn::parse("16").is_err());
        assert!(Lsn::parse("16/").is_err());
        assert!(Lsn::parse("/16").is_err());
        assert!(Lsn::parse("1G/16").is_err());
    }

    #[test]
    fn format_round_trips() {
        let lsn = Lsn::parse("0/A9F22928").unwrap();
        assert_eq!(lsn.to_string(), "0/A9F22928");
    }

    #[test]
    fn zero_is_strictly_smallest() {
        let zero = Lsn::parse("0/0").unwrap();
        assert!(zero.is_zero());
        for s in ["0/1", "1/0", "FFFF/FFFF"] {
            let other = Lsn::parse(s).unwrap();
            assert_eq!(Lsn::compare(&zero, &other), -1);
            assert_eq!(Lsn::compare(&other, &zero), 1);
        }
    }

    #[test]
    fn base16_not_base10() {
        // The major segment must be read as hex: "10" is 16, not 10.
        let lsn = Lsn::parse("10/0").unwrap();
        assert_eq!(lsn.major(), 16);
    }

    #[test]
    fn ordering_is_lexicographic_on_pair() {
        let a = Lsn::new(1, 0xFFFF_FFFF);
        let b = Lsn::new(2, 0);
        assert_eq!(Lsn::compare(&a, &b), -1);
    }

    #[test]
    fn total_order_properties() {
        let values = ["0/0", "0/1", "1/0", "1/FF", "A/0", "FFFFFFFF/FFFFFFFF"];
        let lsns: Vec<Lsn> = values.iter().map(|s| Lsn::parse(s).unwrap()).collect();

        for a in &lsns {
            // antisymmetry
            assert_eq!(Lsn::compare(a, a), 0);
            for b in &lsns {
                assert_eq!(Lsn::compare(a, b), -Lsn::compare(b, a));
            }
        }

        // transitivity over all ordered triples
        for a in &lsns {
            for b in &lsns {
                for c in &lsns {
                    if Lsn::compare(a, b) <= 0 && Lsn::compare(b, c) <= 0 {
                        assert!(Lsn::compare(a, c) <= 0);
                    }
                }
            }
        }
    }
}
