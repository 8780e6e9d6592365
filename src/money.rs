//! Money Module
//!
//! Client-facing amount parsing and currency codes. Amounts are carried as
//! `rust_decimal::Decimal` end to end; binary floating point never touches a
//! balance.
//!
//! ## Usage
//! ```rust
//! use transfer_saga::money::{Currency, parse_amount};
//!
//! let amount = parse_amount("300.50", 2).unwrap();
//! assert_eq!(amount.to_string(), "300.50");
//!
//! let eur = Currency::new("eur").unwrap();
//! assert_eq!(eur.as_str(), "EUR");
//! ```

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default maximum fractional digits accepted for an amount
pub const DEFAULT_MAX_SCALE: u32 = 2;

// ============================================================================
// Error Types
// ============================================================================

/// Money parsing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must be positive")]
    InvalidAmount,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Invalid currency code: {0}")]
    InvalidCurrency(String),
}

// ============================================================================
// Currency
// ============================================================================

/// ISO-4217 style currency code (three ASCII letters, upper-cased)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> Result<Self, MoneyError> {
        let code = code.trim();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(MoneyError::InvalidCurrency(code.to_string()));
        }
        Ok(Self(code.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Currency {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Currency::new(s)
    }
}

// ============================================================================
// Parse: Client → Internal
// ============================================================================

/// Convert a client string amount to a `Decimal`
///
/// # Errors
/// * `InvalidFormat` - empty or not a plain decimal number
/// * `InvalidAmount` - zero or signed
/// * `PrecisionOverflow` - more fractional digits than `max_scale`
pub fn parse_amount(amount_str: &str, max_scale: u32) -> Result<Decimal, MoneyError> {
    let amount_str = amount_str.trim();
    if amount_str.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }

    if amount_str.starts_with('-') || amount_str.starts_with('+') {
        return Err(MoneyError::InvalidAmount);
    }

    // Strict: both sides of the dot must be present (".5" and "5." are ambiguous)
    if let Some((whole, frac)) = amount_str.split_once('.')
        && (whole.is_empty() || frac.is_empty())
    {
        return Err(MoneyError::InvalidFormat(format!(
            "ambiguous decimal format: {amount_str}"
        )));
    }

    let value = Decimal::from_str(amount_str)
        .map_err(|e| MoneyError::InvalidFormat(format!("{amount_str}: {e}")))?;

    validate_amount(value, max_scale)?;
    Ok(value)
}

/// Check an already-typed amount: strictly positive and within `max_scale`
pub fn validate_amount(amount: Decimal, max_scale: u32) -> Result<(), MoneyError> {
    if amount <= Decimal::ZERO {
        return Err(MoneyError::InvalidAmount);
    }
    let provided = amount.normalize().scale();
    if provided > max_scale {
        return Err(MoneyError::PrecisionOverflow {
            provided,
            max: max_scale,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_amount_valid() {
        assert_eq!(parse_amount("300", 2).unwrap(), Decimal::from(300));
        assert_eq!(parse_amount(" 0.01 ", 2).unwrap(), Decimal::new(1, 2));
        // trailing zeros beyond scale are not real precision
        assert_eq!(parse_amount("1.500", 2).unwrap(), Decimal::new(15, 1));
    }

    #[test]
    fn test_parse_amount_rejects() {
        assert_eq!(parse_amount("0", 2), Err(MoneyError::InvalidAmount));
        assert_eq!(parse_amount("-5", 2), Err(MoneyError::InvalidAmount));
        assert!(matches!(parse_amount("", 2), Err(MoneyError::InvalidFormat(_))));
        assert!(matches!(parse_amount(".5", 2), Err(MoneyError::InvalidFormat(_))));
        assert!(matches!(parse_amount("5.", 2), Err(MoneyError::InvalidFormat(_))));
        assert!(matches!(parse_amount("abc", 2), Err(MoneyError::InvalidFormat(_))));
        assert_eq!(
            parse_amount("1.001", 2),
            Err(MoneyError::PrecisionOverflow { provided: 3, max: 2 })
        );
    }

    #[test]
    fn test_currency() {
        assert_eq!(Currency::new("usd").unwrap().as_str(), "USD");
        assert!(Currency::new("US").is_err());
        assert!(Currency::new("US1").is_err());
        assert_eq!("EUR".parse::<Currency>().unwrap().to_string(), "EUR");
    }
}
