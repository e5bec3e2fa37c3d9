use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{EXPIRY_MAX_YEARS_AHEAD, PAN_MAX_LEN, PAN_MIN_LEN};
use crate::error::GatewayError;

// ── Pan ──────────────────────────────────────────────────────────────────────

/// A validated Primary Account Number.
///
/// `Debug` and `Display` render only the last four digits; the full value is
/// deliberately not `Serialize` so a PAN can never ride along in a response
/// body or an event payload.
#[derive(Clone, PartialEq, Eq)]
pub struct Pan(String);

impl Pan {
    /// Validate digits-only, 13-19 characters, Luhn-correct.
    pub fn parse(s: &str) -> Result<Self, GatewayError> {
        if s.len() < PAN_MIN_LEN || s.len() > PAN_MAX_LEN {
            return Err(GatewayError::InvalidCard(format!(
                "card number must be {PAN_MIN_LEN}-{PAN_MAX_LEN} digits"
            )));
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(GatewayError::InvalidCard("card number must be digits only".into()));
        }
        if !luhn_valid(s) {
            return Err(GatewayError::InvalidCard("card number fails Luhn check".into()));
        }
        Ok(Self(s.to_string()))
    }

    /// The raw digits. Only the tokenization vault may look at these.
    pub fn digits(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last_four(&self) -> String {
        self.0[self.0.len() - 4..].to_string()
    }

    pub fn brand(&self) -> CardBrand {
        CardBrand::detect(&self.0)
    }
}

impl fmt::Display for Pan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "**** **** **** {}", self.last_four())
    }
}

impl fmt::Debug for Pan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pan(**** {})", self.last_four())
    }
}

/// Standard Luhn (mod-10) checksum over a digit string.
pub fn luhn_valid(digits: &str) -> bool {
    let mut sum = 0u32;
    for (i, b) in digits.bytes().rev().enumerate() {
        let mut d = (b - b'0') as u32;
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    sum % 10 == 0
}

// ── CardBrand ────────────────────────────────────────────────────────────────

/// Card network detected from the BIN prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CardBrand {
    Visa,
    Mastercard,
    Amex,
    Discover,
    Unknown,
}

impl CardBrand {
    /// BIN ranges: Visa 4; Mastercard 51-55 and 2221-2720; Amex 34/37;
    /// Discover 6011 and 65.
    pub fn detect(digits: &str) -> CardBrand {
        if digits.starts_with('4') {
            return CardBrand::Visa;
        }
        if let Ok(two) = digits.get(..2).unwrap_or("").parse::<u32>() {
            if (51..=55).contains(&two) {
                return CardBrand::Mastercard;
            }
            if two == 34 || two == 37 {
                return CardBrand::Amex;
            }
            if two == 65 {
                return CardBrand::Discover;
            }
        }
        if let Ok(four) = digits.get(..4).unwrap_or("").parse::<u32>() {
            if (2221..=2720).contains(&four) {
                return CardBrand::Mastercard;
            }
            if four == 6011 {
                return CardBrand::Discover;
            }
        }
        CardBrand::Unknown
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CardBrand::Visa => "VISA",
            CardBrand::Mastercard => "MASTERCARD",
            CardBrand::Amex => "AMEX",
            CardBrand::Discover => "DISCOVER",
            CardBrand::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for CardBrand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── CardExpiry ───────────────────────────────────────────────────────────────

/// Month/year card expiry, validated against a supplied "now".
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardExpiry {
    pub month: u8,
    pub year: u16,
}

impl CardExpiry {
    /// month 1-12; (year, month) not in the past and not more than ten years
    /// out, measured from `now` (Unix seconds).
    pub fn parse(month: u8, year: u16, now: crate::types::Timestamp) -> Result<Self, GatewayError> {
        if !(1..=12).contains(&month) {
            return Err(GatewayError::InvalidExpiry(format!("month {month} out of range")));
        }
        let now_dt = chrono::DateTime::from_timestamp(now, 0)
            .ok_or_else(|| GatewayError::InvalidExpiry("clock out of range".into()))?;
        let (now_year, now_month) = {
            use chrono::Datelike;
            (now_dt.year() as i32, now_dt.month() as u8)
        };
        let exp = (year as i32, month);
        if exp < (now_year, now_month) {
            return Err(GatewayError::InvalidExpiry(format!("{month:02}/{year} is in the past")));
        }
        if year as i32 > now_year + EXPIRY_MAX_YEARS_AHEAD {
            return Err(GatewayError::InvalidExpiry(format!(
                "{month:02}/{year} is more than {EXPIRY_MAX_YEARS_AHEAD} years out"
            )));
        }
        Ok(Self { month, year })
    }

    /// Last instant of the expiry month as a Unix timestamp (first second of
    /// the following month minus one).
    pub fn expires_at(&self) -> crate::types::Timestamp {
        use chrono::TimeZone;
        let (next_y, next_m) = if self.month == 12 {
            (self.year as i32 + 1, 1)
        } else {
            (self.year as i32, self.month as u32 + 1)
        };
        chrono::Utc
            .with_ymd_and_hms(next_y, next_m, 1, 0, 0, 0)
            .single()
            .map(|dt| dt.timestamp() - 1)
            .unwrap_or(i64::MAX)
    }
}

impl fmt::Display for CardExpiry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}/{}", self.month, self.year)
    }
}

impl fmt::Debug for CardExpiry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CardExpiry({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Fixed "now": 2026-06-01 00:00:00 UTC.
    const NOW: i64 = 1_780_272_000;

    #[test]
    fn valid_visa_pan() {
        let pan = Pan::parse("4532015112830366").unwrap();
        assert_eq!(pan.last_four(), "0366");
        assert_eq!(pan.brand(), CardBrand::Visa);
    }

    #[test]
    fn luhn_rejects_tampered_pan() {
        assert!(Pan::parse("4532015112830367").is_err());
    }

    #[test]
    fn pan_length_bounds() {
        assert!(Pan::parse("4111111").is_err());
        assert!(Pan::parse("41111111111111111111111").is_err());
    }

    #[test]
    fn display_never_shows_full_pan() {
        let pan = Pan::parse("4532015112830366").unwrap();
        let shown = format!("{pan} {pan:?}");
        assert!(!shown.contains("4532015112830366"));
        assert!(shown.contains("0366"));
    }

    #[test]
    fn brand_detection_table() {
        assert_eq!(CardBrand::detect("4111111111111111"), CardBrand::Visa);
        assert_eq!(CardBrand::detect("5555555555554444"), CardBrand::Mastercard);
        assert_eq!(CardBrand::detect("2221000000000009"), CardBrand::Mastercard);
        assert_eq!(CardBrand::detect("371449635398431"), CardBrand::Amex);
        assert_eq!(CardBrand::detect("6011111111111117"), CardBrand::Discover);
        assert_eq!(CardBrand::detect("6511111111111111"), CardBrand::Discover);
        assert_eq!(CardBrand::detect("9999999999999999"), CardBrand::Unknown);
    }

    #[test]
    fn expiry_rejects_past_and_far_future() {
        assert!(CardExpiry::parse(0, 2030, NOW).is_err());
        assert!(CardExpiry::parse(13, 2030, NOW).is_err());
        assert!(CardExpiry::parse(5, 2026, NOW).is_err());
        assert!(CardExpiry::parse(6, 2026, NOW).is_ok());
        assert!(CardExpiry::parse(1, 2037, NOW).is_err());
        assert!(CardExpiry::parse(12, 2030, NOW).is_ok());
    }
}
