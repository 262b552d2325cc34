//! Monetary types for ratefeed.

use rust_decimal::Decimal;
use std::borrow::Borrow;
use std::fmt;

/// Number of characters in a currency code.
pub const CURRENCY_CODE_LEN: usize = 3;

/// Number of characters in a concatenated pair key such as `USDEUR`.
pub const PAIR_KEY_LEN: usize = 2 * CURRENCY_CODE_LEN;

/// A monetary amount with currency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Money {
    /// The amount value (high precision decimal).
    pub value: Decimal,
    /// Currency code.
    pub currency: Currency,
}

impl Money {
    /// Create a new Money instance.
    pub fn new(value: Decimal, currency: Currency) -> Self {
        Self { value, currency }
    }

    /// Round to the currency's standard decimal places.
    pub fn round(&self) -> Self {
        Self {
            value: self.value.round_dp(self.currency.decimal_places()),
            currency: self.currency.clone(),
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.currency)
    }
}

/// Currency code.
///
/// Codes are opaque: the only structural rule ratefeed relies on is that a
/// pair key splits into two codes of [`CURRENCY_CODE_LEN`] characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Currency(String);

impl Currency {
    /// Create a new currency from code.
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Get the currency code.
    pub fn code(&self) -> &str {
        &self.0
    }

    /// Get the standard decimal places for this currency.
    pub fn decimal_places(&self) -> u32 {
        match self.0.as_str() {
            "JPY" | "KRW" | "VND" => 0,
            "BHD" | "KWD" | "OMR" => 3,
            _ => 2,
        }
    }

    /// Common currencies
    pub fn usd() -> Self {
        Self::new("USD")
    }

    pub fn eur() -> Self {
        Self::new("EUR")
    }

    pub fn gbp() -> Self {
        Self::new("GBP")
    }

    pub fn jpy() -> Self {
        Self::new("JPY")
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Currency {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for Currency {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Lets maps keyed by `Currency` be queried with a plain `&str`.
impl Borrow<str> for Currency {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// An ordered currency pair: one unit of `base` costs `rate` units of `quote`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CurrencyPair {
    /// Base currency.
    pub base: Currency,
    /// Quote currency.
    pub quote: Currency,
}

impl CurrencyPair {
    /// Create a new currency pair.
    pub fn new(base: Currency, quote: Currency) -> Self {
        Self { base, quote }
    }

    /// Split a concatenated pair key (`"USDEUR"`) into its two codes.
    ///
    /// Returns `None` unless the key is exactly [`PAIR_KEY_LEN`] characters.
    /// Length is counted in characters, so non-ASCII codes split cleanly.
    pub fn from_key(key: &str) -> Option<Self> {
        if key.chars().count() != PAIR_KEY_LEN {
            return None;
        }
        let (split, _) = key.char_indices().nth(CURRENCY_CODE_LEN)?;
        let (base, quote) = key.split_at(split);
        Some(Self::new(Currency::new(base), Currency::new(quote)))
    }

    /// The concatenated pair key, e.g. `USDEUR`.
    pub fn key(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}
