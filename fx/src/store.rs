//! Copy-on-write rate store shared between the ingestion task and readers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use ratefeed_common::{Currency, CurrencyPair, Money};
use rust_decimal::Decimal;
use tracing::debug;

use crate::error::{FxError, FxResult};
use crate::table::RateTable;

/// A published, immutable generation of the rate table.
#[derive(Debug)]
pub struct RateSnapshot {
    table: RateTable,
    version: u64,
    published_at: Option<DateTime<Utc>>,
}

impl RateSnapshot {
    fn empty() -> Self {
        Self {
            table: RateTable::new(),
            version: 0,
            published_at: None,
        }
    }

    /// The table of this generation.
    pub fn table(&self) -> &RateTable {
        &self.table
    }

    /// Generation number; 0 is the empty table installed at construction.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// When this generation was installed, `None` for the initial table.
    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.published_at
    }

    /// Look up an ordered pair in this generation.
    pub fn rate(&self, base: &str, quote: &str) -> Option<Decimal> {
        self.table.rate(base, quote)
    }
}

/// Holds the current rate table.
///
/// Writers build a complete [`RateTable`] and swap it in with
/// [`replace`](Self::replace). Readers clone the current `Arc` under a read
/// lock that is held for a pointer copy only, so a reader sees one whole
/// generation and never waits on table construction.
pub struct RateStore {
    current: RwLock<Arc<RateSnapshot>>,
}

impl RateStore {
    /// Create a store holding an empty table.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(RateSnapshot::empty())),
        }
    }

    /// Install `table` as the current generation and return its version.
    ///
    /// The previous generation is discarded; readers still holding it keep
    /// a valid view until they drop their snapshot.
    pub fn replace(&self, table: RateTable) -> u64 {
        let pairs = table.len();
        let previous;
        let version;
        {
            let mut current = self.current.write();
            version = current.version + 1;
            let next = Arc::new(RateSnapshot {
                table,
                version,
                published_at: Some(Utc::now()),
            });
            previous = std::mem::replace(&mut *current, next);
        }
        // Old table is freed outside the lock.
        drop(previous);

        debug!(version, pairs, "Rate table replaced");
        version
    }

    /// Get the current rate for an ordered pair.
    pub fn get(&self, base: impl AsRef<str>, quote: impl AsRef<str>) -> FxResult<Decimal> {
        let (base, quote) = (base.as_ref(), quote.as_ref());
        self.snapshot().rate(base, quote).ok_or_else(|| {
            FxError::RateNotFound(CurrencyPair::new(Currency::new(base), Currency::new(quote)))
        })
    }

    /// Get the current rate for a [`CurrencyPair`].
    pub fn get_pair(&self, pair: &CurrencyPair) -> FxResult<Decimal> {
        self.snapshot()
            .rate(pair.base.code(), pair.quote.code())
            .ok_or_else(|| FxError::RateNotFound(pair.clone()))
    }

    /// The whole current generation at a single point in time.
    pub fn snapshot(&self) -> Arc<RateSnapshot> {
        self.current.read().clone()
    }

    /// Version of the current generation.
    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// When the current generation was installed.
    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.current.read().published_at
    }

    /// Time since the last replace, `None` if nothing was ever published.
    pub fn age(&self) -> Option<chrono::Duration> {
        self.published_at()
            .map(|at| Utc::now().signed_duration_since(at))
    }

    /// Whether the table is older than `max_age` or was never published.
    pub fn is_stale(&self, max_age: std::time::Duration) -> bool {
        match self.age() {
            None => true,
            Some(age) => age.to_std().map(|age| age > max_age).unwrap_or(false),
        }
    }

    /// Convert `amount` into `target` using the direct pair rate.
    ///
    /// The result is rounded to the target currency's minor units.
    pub fn convert(&self, amount: &Money, target: &Currency) -> FxResult<Money> {
        if amount.currency == *target {
            return Ok(amount.clone());
        }

        let pair = CurrencyPair::new(amount.currency.clone(), target.clone());
        let rate = self.get_pair(&pair)?;
        let value = amount
            .value
            .checked_mul(rate)
            .ok_or_else(|| FxError::ConversionOverflow(pair.clone()))?;

        Ok(Money::new(value, target.clone()).round())
    }
}

impl Default for RateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared rate store.
pub type SharedRateStore = Arc<RateStore>;
