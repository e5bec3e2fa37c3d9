use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::GatewayError;

/// Scale-2 fixed-point monetary amount held as a count of minor units.
///
/// All arithmetic is integer and checked; there is no floating point anywhere
/// on the money path.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    pub fn minor_units(&self) -> i64 {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Parse a decimal string with at most two fractional digits
    /// (`"100"`, `"100.5"`, `"100.00"`). Anything else is rejected.
    pub fn parse(s: &str) -> Result<Self, GatewayError> {
        let err = || GatewayError::InvalidAmount(s.to_string());
        let (neg, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (whole, frac) = match body.split_once('.') {
            Some((_, f)) if f.is_empty() => return Err(err()),
            Some((w, f)) => (w, f),
            None => (body, ""),
        };
        if whole.is_empty() || whole.len() > 16 || frac.len() > 2 {
            return Err(err());
        }
        if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let whole: i64 = whole.parse().map_err(|_| err())?;
        let frac_minor: i64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<i64>().map_err(|_| err())? * 10,
            _ => frac.parse().map_err(|_| err())?,
        };
        let minor = whole.checked_mul(100).and_then(|w| w.checked_add(frac_minor)).ok_or_else(err)?;
        Ok(Self(if neg { -minor } else { minor }))
    }

    pub fn checked_add(&self, other: Amount) -> Result<Amount, GatewayError> {
        self.0
            .checked_add(other.0)
            .map(Amount)
            .ok_or_else(|| GatewayError::InvalidAmount("amount overflow".into()))
    }

    pub fn checked_sub(&self, other: Amount) -> Result<Amount, GatewayError> {
        self.0
            .checked_sub(other.0)
            .map(Amount)
            .ok_or_else(|| GatewayError::InvalidAmount("amount underflow".into()))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Amount({self})")
    }
}

// ── Currency ─────────────────────────────────────────────────────────────────

/// ISO-4217 alphabetic currency code (three uppercase ASCII letters).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency([u8; 3]);

impl Currency {
    pub const USD: Currency = Currency(*b"USD");
    pub const EUR: Currency = Currency(*b"EUR");

    pub fn parse(s: &str) -> Result<Self, GatewayError> {
        let bytes = s.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(|b| b.is_ascii_uppercase()) {
            return Err(GatewayError::InvalidCurrency(s.to_string()));
        }
        Ok(Self([bytes[0], bytes[1], bytes[2]]))
    }

    pub fn as_str(&self) -> &str {
        // Constructed only from validated ASCII uppercase.
        std::str::from_utf8(&self.0).expect("currency bytes are ASCII")
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Debug for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Currency({})", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        for s in ["0.00", "100.00", "13.00", "0.01", "99999.99"] {
            assert_eq!(Amount::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn parse_accepts_short_fractions() {
        assert_eq!(Amount::parse("100").unwrap().minor_units(), 10_000);
        assert_eq!(Amount::parse("100.5").unwrap().minor_units(), 10_050);
    }

    #[test]
    fn parse_rejects_garbage() {
        for s in ["", ".", "1.234", "1,00", "abc", "1.", "1.2.3", "--1"] {
            assert!(Amount::parse(s).is_err(), "{s} should not parse");
        }
    }

    #[test]
    fn currency_validation() {
        assert_eq!(Currency::parse("USD").unwrap(), Currency::USD);
        assert!(Currency::parse("usd").is_err());
        assert!(Currency::parse("USDT").is_err());
    }
}
