//! Rate snapshot messages and their expansion into a bidirectional table.

use ratefeed_common::CurrencyPair;
use ratefeed_fx::RateTable;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::error::{IngestError, IngestResult};

/// One complete replacement set of rates, as received from the stream.
///
/// Payloads are JSON objects mapping pair keys (`"USDEUR"`) to a rate given
/// either as a JSON number or as a decimal string. Entries are kept in the
/// order the JSON map yields them, which is sorted by key; a repeated key
/// keeps only its last value.
#[derive(Debug, Clone)]
pub struct SnapshotMessage {
    entries: Vec<(String, Value)>,
}

/// Result of expanding a snapshot message.
#[derive(Debug)]
pub struct Expansion {
    /// The freshly built table, ready to be published.
    pub table: RateTable,
    /// Number of entries that made it into the table.
    pub applied: usize,
    /// Entries that were skipped, with the reason.
    pub skipped: Vec<IngestError>,
}

impl SnapshotMessage {
    /// Parse a raw payload.
    ///
    /// Anything other than a JSON object is a [`IngestError::MessageParse`].
    pub fn parse(payload: &[u8]) -> IngestResult<Self> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| IngestError::MessageParse(e.to_string()))?;

        match value {
            Value::Object(map) => Ok(Self {
                entries: map.into_iter().collect(),
            }),
            other => Err(IngestError::MessageParse(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Number of entries in the message.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build a fresh table holding every valid entry and its inverse.
    ///
    /// Invalid entries are collected in [`Expansion::skipped`]; they never
    /// prevent the remaining entries from being applied. When an entry and
    /// the inverse of an earlier one name the same pair, the later entry wins.
    pub fn expand(&self) -> Expansion {
        let mut table = RateTable::new();
        let mut applied = 0;
        let mut skipped = Vec::new();

        for (key, value) in &self.entries {
            match parse_entry(key, value) {
                Ok((pair, rate, inverse)) => {
                    let CurrencyPair { base, quote } = pair;
                    table.set(base.clone(), quote.clone(), rate);
                    table.set(quote, base, inverse);
                    applied += 1;
                }
                Err(e) => skipped.push(e),
            }
        }

        Expansion {
            table,
            applied,
            skipped,
        }
    }
}

fn parse_entry(key: &str, value: &Value) -> IngestResult<(CurrencyPair, Decimal, Decimal)> {
    let pair = CurrencyPair::from_key(key).ok_or_else(|| IngestError::InvalidPairKey {
        key: key.to_string(),
    })?;
    let rate = parse_rate(key, value)?;
    let inverse = invert(key, rate)?;
    Ok((pair, rate, inverse))
}

/// Read a rate from a JSON number or decimal string.
///
/// Numbers keep their source text (`arbitrary_precision`), so no digit is
/// lost to an `f64` on the way to `Decimal`.
fn parse_rate(key: &str, value: &Value) -> IngestResult<Decimal> {
    let text = match value {
        Value::String(s) => s.trim(),
        Value::Number(n) => n.as_str(),
        other => {
            return Err(IngestError::InvalidRateValue {
                key: key.to_string(),
                value: other.to_string(),
            })
        }
    };

    text.parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(text))
        .map_err(|_| IngestError::InvalidRateValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

/// `1 / rate`, rejecting rates that have no meaningful inverse.
fn invert(key: &str, rate: Decimal) -> IngestResult<Decimal> {
    let degenerate = || IngestError::DegenerateRate {
        key: key.to_string(),
        rate,
    };

    if rate <= Decimal::ZERO {
        return Err(degenerate());
    }
    Decimal::ONE.checked_div(rate).ok_or_else(degenerate)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn expand(payload: &str) -> Expansion {
        SnapshotMessage::parse(payload.as_bytes()).unwrap().expand()
    }

    #[test]
    fn test_single_pair_expands_both_directions() {
        let expansion = expand(r#"{"USDEUR": "0.9"}"#);

        assert_eq!(expansion.applied, 1);
        assert!(expansion.skipped.is_empty());
        assert_eq!(expansion.table.rate("USD", "EUR"), Some(dec!(0.9)));
        assert_eq!(expansion.table.rate("EUR", "USD"), Some(dec!(1) / dec!(0.9)));
        assert_eq!(
            expansion.table.rate("EUR", "USD"),
            Some(dec!(1.1111111111111111111111111111))
        );
    }

    #[test]
    fn test_numeric_and_scientific_values() {
        let expansion = expand(r#"{"USDJPY": 150, "USDEUR": 0.9, "BTCUSD": "1e-5"}"#);

        assert_eq!(expansion.applied, 3);
        assert_eq!(expansion.table.rate("USD", "JPY"), Some(dec!(150)));
        assert_eq!(expansion.table.rate("USD", "EUR"), Some(dec!(0.9)));
        assert_eq!(expansion.table.rate("BTC", "USD"), Some(dec!(0.00001)));
        assert_eq!(expansion.table.rate("USD", "BTC"), Some(dec!(100000)));
    }

    #[test]
    fn test_numeric_value_keeps_full_precision() {
        let numeric = expand(r#"{"USDEUR": 0.12345678901234567890123}"#);
        let text = expand(r#"{"USDEUR": "0.12345678901234567890123"}"#);

        assert_eq!(
            numeric.table.rate("USD", "EUR"),
            Some(dec!(0.12345678901234567890123))
        );
        assert_eq!(numeric.table, text.table);
    }

    #[test]
    fn test_bad_key_is_skipped() {
        let expansion = expand(r#"{"US": "1.0", "USDEUR": "0.9"}"#);

        assert_eq!(expansion.applied, 1);
        assert_eq!(expansion.skipped.len(), 1);
        assert!(matches!(
            &expansion.skipped[0],
            IngestError::InvalidPairKey { key } if key == "US"
        ));
        assert_eq!(expansion.table.rate("USD", "EUR"), Some(dec!(0.9)));
    }

    #[test]
    fn test_degenerate_rates_are_skipped() {
        let expansion = expand(r#"{"USDEUR": "0", "USDGBP": "-0.8", "USDJPY": "150"}"#);

        assert_eq!(expansion.applied, 1);
        assert_eq!(expansion.skipped.len(), 2);
        assert!(expansion
            .skipped
            .iter()
            .all(|e| matches!(e, IngestError::DegenerateRate { .. })));
        assert_eq!(expansion.table.rate("USD", "EUR"), None);
        assert_eq!(expansion.table.rate("GBP", "USD"), None);
        assert_eq!(expansion.table.len(), 2);
    }

    #[test]
    fn test_unparseable_values_are_skipped() {
        let expansion = expand(r#"{"USDEUR": "abc", "USDGBP": null, "USDJPY": [1]}"#);

        assert_eq!(expansion.applied, 0);
        assert_eq!(expansion.skipped.len(), 3);
        assert!(expansion
            .skipped
            .iter()
            .all(|e| matches!(e, IngestError::InvalidRateValue { .. })));
        assert!(expansion.table.is_empty());
    }

    #[test]
    fn test_later_entry_wins_over_inverse() {
        // Map iteration is key-ordered: EURUSD is processed before USDEUR.
        let expansion = expand(r#"{"USDEUR": "0.9", "EURUSD": "1.25"}"#);

        assert_eq!(expansion.applied, 2);
        assert_eq!(expansion.table.rate("USD", "EUR"), Some(dec!(0.9)));
        assert_eq!(expansion.table.rate("EUR", "USD"), Some(dec!(1) / dec!(0.9)));
    }

    #[test]
    fn test_duplicate_key_keeps_last_value() {
        let expansion = expand(r#"{"USDEUR": "0.9", "USDEUR": "0.95"}"#);

        assert_eq!(expansion.applied, 1);
        assert_eq!(expansion.table.rate("USD", "EUR"), Some(dec!(0.95)));
    }

    #[test]
    fn test_non_object_payload_is_rejected() {
        for payload in ["[1, 2]", "\"USDEUR\"", "42", "{not json"] {
            let result = SnapshotMessage::parse(payload.as_bytes());
            assert!(
                matches!(result, Err(IngestError::MessageParse(_))),
                "payload {payload} should be rejected"
            );
        }
    }

    #[test]
    fn test_empty_object() {
        let message = SnapshotMessage::parse(b"{}").unwrap();
        assert!(message.is_empty());

        let expansion = message.expand();
        assert_eq!(expansion.applied, 0);
        assert!(expansion.table.is_empty());
    }

    fn rate_strategy() -> impl Strategy<Value = Decimal> {
        (1i64..1_000_000_000, 0u32..10).prop_map(|(mantissa, scale)| Decimal::new(mantissa, scale))
    }

    proptest! {
        #[test]
        fn test_inverse_matches_forward_rate(rate in rate_strategy()) {
            let payload = format!(r#"{{"AAABBB": "{}"}}"#, rate);
            let expansion = expand(&payload);

            let forward = expansion.table.rate("AAA", "BBB").unwrap();
            let backward = expansion.table.rate("BBB", "AAA").unwrap();
            prop_assert_eq!(forward, rate);
            prop_assert_eq!(backward, Decimal::ONE / forward);
        }

        #[test]
        fn test_expansion_is_deterministic(
            rates in proptest::collection::btree_map("[A-Z]{6}", rate_strategy(), 0..8)
        ) {
            let body: Vec<String> = rates
                .iter()
                .map(|(key, rate)| format!(r#""{}": "{}""#, key, rate))
                .collect();
            let payload = format!("{{{}}}", body.join(","));

            let first = expand(&payload);
            let second = expand(&payload);
            prop_assert_eq!(first.table, second.table);
            prop_assert_eq!(first.applied, rates.len());
        }
    }
}
