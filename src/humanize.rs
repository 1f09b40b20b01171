//! Human-readable byte sizes and durations for config values and the history table

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid size format: {0}")]
    InvalidFormat(String),

    #[error("Invalid number: {0}")]
    InvalidNumber(#[from] std::num::ParseIntError),

    #[error("Invalid unit: {0}")]
    InvalidUnit(String),

    #[error("Size overflows u64: {0}")]
    Overflow(String),
}

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;

/// Byte count that deserializes from either an integer or a string like `"1MB"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const fn mib(n: u64) -> Self {
        ByteSize(n * MIB)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }

    /// Two-decimal rendering used in the history table, e.g. `137.51MB`
    pub fn to_human_readable(&self) -> String {
        const UNITS: &[(&str, u64)] = &[("TB", TIB), ("GB", GIB), ("MB", MIB), ("KB", KIB)];

        for &(unit, divisor) in UNITS {
            if self.0 >= divisor {
                return format!("{:.2}{}", self.0 as f64 / divisor as f64, unit);
            }
        }

        format!("{}B", self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ByteSizeVisitor;

        impl<'de> serde::de::Visitor<'de> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a byte size as string (e.g., \"1MB\", \"512KB\") or integer")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(ByteSize(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                u64::try_from(v)
                    .map(ByteSize)
                    .map_err(|_| E::custom(format!("negative byte size: {v}")))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                v.parse::<ByteSize>().map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

impl FromStr for ByteSize {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_uppercase();

        if let Ok(num) = s.parse::<u64>() {
            return Ok(ByteSize(num));
        }

        let Some(pos) = s.find(|c: char| !c.is_ascii_digit()) else {
            return Err(ParseError::InvalidFormat(s));
        };
        if pos == 0 {
            return Err(ParseError::InvalidFormat(s));
        }
        let (num_str, unit) = s.split_at(pos);
        let num: u64 = num_str.parse()?;

        let multiplier = match unit.trim() {
            "B" => 1,
            "K" | "KB" | "KIB" => KIB,
            "M" | "MB" | "MIB" => MIB,
            "G" | "GB" | "GIB" => GIB,
            "T" | "TB" | "TIB" => TIB,
            other => return Err(ParseError::InvalidUnit(other.to_string())),
        };

        num.checked_mul(multiplier)
            .map(ByteSize)
            .ok_or(ParseError::Overflow(s))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_human_readable())
    }
}

/// `H:MM:SS`, matching the uptime line and the DURATION column
pub fn human_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}
