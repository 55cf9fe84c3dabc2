//! TDS protocol version handling.
//!
//! Several wire layouts change with the negotiated version: the ERROR/INFO
//! line number and the DONE row count both widen at TDS 7.2, and clients
//! older than 7.1 exchange single-byte text. TDS 8.0 is encoded as
//! `0x08000000`, which is numerically lower than every 7.x value, so
//! comparisons go through [`TdsVersion::at_least`] or the [`Ord`] impl
//! rather than the raw integer.

use core::cmp::Ordering;
use core::fmt;

/// TDS protocol version as carried in LOGIN7 and LOGINACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TdsVersion(u32);

impl TdsVersion {
    /// TDS 7.0 (SQL Server 7.0)
    pub const V7_0: Self = Self(0x70000000);

    /// TDS 7.1 (SQL Server 2000)
    pub const V7_1: Self = Self(0x71000000);

    /// TDS 7.1 Revision 1 (SQL Server 2000 SP1)
    pub const V7_1_REV1: Self = Self(0x71000001);

    /// TDS 7.2 (SQL Server 2005)
    pub const V7_2: Self = Self(0x72090002);

    /// TDS 7.3A (SQL Server 2008)
    pub const V7_3A: Self = Self(0x730A0003);

    /// TDS 7.3B (SQL Server 2008 R2)
    pub const V7_3B: Self = Self(0x730B0003);

    /// TDS 7.4 (SQL Server 2012+)
    pub const V7_4: Self = Self(0x74000004);

    /// TDS 8.0 (SQL Server 2022+ strict encryption mode)
    pub const V8_0: Self = Self(0x08000000);

    /// Create a version from its wire value.
    #[must_use]
    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    /// Raw wire value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Check for TDS 8.0.
    #[must_use]
    pub const fn is_tds_8(self) -> bool {
        self.0 == Self::V8_0.0
    }

    /// Position of this version on a monotonic scale where 8.0 sorts last.
    const fn rank(self) -> u64 {
        if self.is_tds_8() {
            0x1_0000_0000
        } else {
            self.0 as u64
        }
    }

    /// Whether this version is the same as or newer than `other`.
    #[must_use]
    pub const fn at_least(self, other: Self) -> bool {
        self.rank() >= other.rank()
    }

    /// Whether counts and line numbers use the widened 7.2+ layout.
    ///
    /// DONE row counts are 8 bytes and ERROR/INFO line numbers are 4 bytes
    /// from TDS 7.2 onward; earlier versions use 4 and 2 bytes.
    #[must_use]
    pub const fn uses_wide_counts(self) -> bool {
        self.at_least(Self::V7_2)
    }

    /// Whether textual session values travel as UTF-16LE.
    #[must_use]
    pub const fn is_unicode(self) -> bool {
        self.at_least(Self::V7_1)
    }

    /// The lower of two versions.
    #[must_use]
    pub const fn min(self, other: Self) -> Self {
        if self.rank() <= other.rank() { self } else { other }
    }

    /// Parse a version from text such as `"7.4"`, `"7.3b"` or `"8"`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "7.0" => Some(Self::V7_0),
            "7.1" => Some(Self::V7_1),
            "7.2" => Some(Self::V7_2),
            "7.3" | "7.3a" => Some(Self::V7_3A),
            "7.3b" => Some(Self::V7_3B),
            "7.4" => Some(Self::V7_4),
            "8.0" | "8" => Some(Self::V8_0),
            _ => None,
        }
    }

    /// Logical minor version (0 through 4 for 7.x, 0 for 8.0).
    #[must_use]
    pub const fn minor(self) -> u8 {
        if self.is_tds_8() {
            0
        } else {
            ((self.0 >> 24) & 0x0F) as u8
        }
    }
}

impl Default for TdsVersion {
    fn default() -> Self {
        Self::V7_4
    }
}

impl PartialOrd for TdsVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TdsVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for TdsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::V8_0 => write!(f, "TDS 8.0"),
            Self::V7_3A => write!(f, "TDS 7.3A"),
            Self::V7_3B => write!(f, "TDS 7.3B"),
            _ => write!(f, "TDS 7.{}", self.minor()),
        }
    }
}

impl From<u32> for TdsVersion {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<TdsVersion> for u32 {
    fn from(version: TdsVersion) -> Self {
        version.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tds_8_orders_above_7x() {
        assert!(TdsVersion::V8_0 > TdsVersion::V7_4);
        assert!(TdsVersion::V8_0.at_least(TdsVersion::V7_2));
        assert!(!TdsVersion::V7_4.at_least(TdsVersion::V8_0));
        assert!(TdsVersion::V7_4 > TdsVersion::V7_3B);
        assert!(TdsVersion::V7_3B > TdsVersion::V7_3A);
    }

    #[test]
    fn test_wide_counts_boundary() {
        assert!(!TdsVersion::V7_1.uses_wide_counts());
        assert!(!TdsVersion::V7_1_REV1.uses_wide_counts());
        assert!(TdsVersion::V7_2.uses_wide_counts());
        assert!(TdsVersion::V7_4.uses_wide_counts());
        assert!(TdsVersion::V8_0.uses_wide_counts());
    }

    #[test]
    fn test_unicode_boundary() {
        assert!(!TdsVersion::V7_0.is_unicode());
        assert!(TdsVersion::V7_1.is_unicode());
        assert!(TdsVersion::V8_0.is_unicode());
    }

    #[test]
    fn test_min_version() {
        assert_eq!(TdsVersion::V7_4.min(TdsVersion::V7_3A), TdsVersion::V7_3A);
        assert_eq!(TdsVersion::V8_0.min(TdsVersion::V7_4), TdsVersion::V7_4);
        assert_eq!(TdsVersion::V7_4.min(TdsVersion::V8_0), TdsVersion::V7_4);
    }

    #[test]
    fn test_parse() {
        assert_eq!(TdsVersion::parse("7.3"), Some(TdsVersion::V7_3A));
        assert_eq!(TdsVersion::parse("7.3B"), Some(TdsVersion::V7_3B));
        assert_eq!(TdsVersion::parse(" 7.4 "), Some(TdsVersion::V7_4));
        assert_eq!(TdsVersion::parse("8"), Some(TdsVersion::V8_0));
        assert_eq!(TdsVersion::parse("9.0"), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(TdsVersion::V7_0.to_string(), "TDS 7.0");
        assert_eq!(TdsVersion::V7_2.to_string(), "TDS 7.2");
        assert_eq!(TdsVersion::V7_3A.to_string(), "TDS 7.3A");
        assert_eq!(TdsVersion::V7_4.to_string(), "TDS 7.4");
        assert_eq!(TdsVersion::V8_0.to_string(), "TDS 8.0");
    }
}
