//! The rate table: base currency -> quote currency -> rate.

use std::collections::HashMap;

use ratefeed_common::{Currency, CurrencyPair};
use rust_decimal::Decimal;

/// A complete set of conversion rates keyed by ordered currency pair.
///
/// Tables are built off to the side and handed to
/// [`RateStore::replace`](crate::RateStore::replace) whole; once published
/// they are never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateTable {
    rates: HashMap<Currency, HashMap<Currency, Decimal>>,
}

impl RateTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the rate for one ordered pair, overwriting any previous value.
    pub fn set(&mut self, base: Currency, quote: Currency, rate: Decimal) {
        self.rates.entry(base).or_default().insert(quote, rate);
    }

    /// Look up the rate for an ordered pair.
    pub fn rate(&self, base: &str, quote: &str) -> Option<Decimal> {
        self.rates.get(base)?.get(quote).copied()
    }

    /// All quotes known for a base currency.
    pub fn quotes(&self, base: &str) -> Option<&HashMap<Currency, Decimal>> {
        self.rates.get(base)
    }

    /// Base currencies present in the table.
    pub fn currencies(&self) -> impl Iterator<Item = &Currency> {
        self.rates.keys()
    }

    /// Iterate over every ordered pair and its rate.
    pub fn iter(&self) -> impl Iterator<Item = (CurrencyPair, Decimal)> + '_ {
        self.rates.iter().flat_map(|(base, quotes)| {
            quotes
                .iter()
                .map(move |(quote, rate)| (CurrencyPair::new(base.clone(), quote.clone()), *rate))
        })
    }

    /// Number of ordered pairs.
    pub fn len(&self) -> usize {
        self.rates.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.values().all(HashMap::is_empty)
    }
}
