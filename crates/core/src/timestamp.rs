//! Two-decimal server timestamps.
//!
//! Every timestamp handled by the service is a number of seconds since the
//! epoch rounded to hundredths. Internally it is kept as an integer count of
//! centiseconds, which is also the on-disk representation of the `modified`
//! column. Conversions from text and floats go through exact decimal
//! arithmetic with round-half-even, so `parse("1.005")` is `1.00` and
//! `parse("1.015")` is `1.02`.

use crate::error::{Error, Result};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// A point in time with 2-decimal precision, stored as centiseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    /// Build from the scaled integer used in the database.
    pub const fn from_centis(centis: i64) -> Self {
        Self(centis)
    }

    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 100)
    }

    /// The scaled integer used in the database.
    pub const fn as_centis(self) -> i64 {
        self.0
    }

    /// Whole seconds, rounded towards negative infinity.
    pub const fn whole_secs(self) -> i64 {
        self.0.div_euclid(100)
    }

    /// Current server time, rounded half-even to hundredths.
    pub fn now() -> Self {
        let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let quotient = nanos.div_euclid(10_000_000);
        let remainder = nanos.rem_euclid(10_000_000);
        let centis = match remainder.cmp(&5_000_000) {
            std::cmp::Ordering::Less => quotient,
            std::cmp::Ordering::Greater => quotient + 1,
            std::cmp::Ordering::Equal => quotient + (quotient & 1),
        };
        Self(centis as i64)
    }

    /// Round a float to hundredths using its shortest decimal representation.
    pub fn from_f64(value: f64) -> Result<Self> {
        if !value.is_finite() {
            return Err(Error::InvalidTimestamp(value.to_string()));
        }
        value.to_string().parse()
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }

    pub fn checked_add_secs(self, secs: i64) -> Option<Self> {
        secs.checked_mul(100)
            .and_then(|c| self.0.checked_add(c))
            .map(Self)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl FromStr for Timestamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_decimal(s.trim()).ok_or_else(|| Error::InvalidTimestamp(s.to_string()))
    }
}

/// Parse `[+-]digits[.digits][e[+-]digits]` into centiseconds.
fn parse_decimal(s: &str) -> Option<Timestamp> {
    let (negative, rest) = match s.as_bytes().first()? {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    let (mantissa, exponent) = match rest.find(['e', 'E']) {
        Some(pos) => (&rest[..pos], rest[pos + 1..].parse::<i32>().ok()?),
        None => (rest, 0),
    };
    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    let digits: Vec<u8> = int_part
        .bytes()
        .chain(frac_part.bytes())
        .map(|b| b - b'0')
        .collect();
    // Position of the centisecond boundary inside `digits`.
    let boundary = int_part.len() as i64 + i64::from(exponent) + 2;

    let mut kept: i64 = 0;
    let split = boundary.clamp(0, digits.len() as i64) as usize;
    for &d in &digits[..split] {
        kept = kept.checked_mul(10)?.checked_add(i64::from(d))?;
    }
    for _ in digits.len() as i64..boundary {
        kept = kept.checked_mul(10)?;
    }

    // Dropped digits, including implicit leading zeros when the boundary
    // falls before the first digit.
    let leading_zeros = (-boundary).max(0) as usize;
    let dropped = &digits[split..];
    let round_up = if leading_zeros > 0 {
        false
    } else {
        match dropped.first() {
            None => false,
            Some(&d) if d > 5 => true,
            Some(&d) if d < 5 => false,
            Some(_) => {
                let exactly_half = dropped[1..].iter().all(|&d| d == 0);
                !exactly_half || kept % 2 == 1
            }
        }
    };
    if round_up {
        kept = kept.checked_add(1)?;
    }

    Some(Timestamp(if negative { -kept } else { kept }))
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct TimestampVisitor;

        impl Visitor<'_> for TimestampVisitor {
            type Value = Timestamp;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a decimal timestamp as a string or number")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Timestamp, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Timestamp, E> {
                v.checked_mul(100)
                    .map(Timestamp)
                    .ok_or_else(|| E::custom("timestamp out of range"))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Timestamp, E> {
                i64::try_from(v)
                    .ok()
                    .and_then(|v| v.checked_mul(100))
                    .map(Timestamp)
                    .ok_or_else(|| E::custom("timestamp out of range"))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Timestamp, E> {
                Timestamp::from_f64(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(TimestampVisitor)
    }
}
