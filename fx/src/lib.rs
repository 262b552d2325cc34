//! Ratefeed FX Store
//!
//! In-memory table of currency conversion rates shared between one writer
//! and any number of concurrent readers.
//!
//! # Features
//!
//! - Whole-table, copy-on-write replacement
//! - Reads that never observe a partially built table
//! - Versioned generations with publish timestamps for staleness checks
//! - Direct-pair amount conversion
//!
//! # Example
//!
//! ```rust
//! use ratefeed_common::Currency;
//! use ratefeed_fx::{RateStore, RateTable};
//! use rust_decimal::Decimal;
//!
//! let store = RateStore::new();
//!
//! let mut table = RateTable::new();
//! table.set(Currency::usd(), Currency::eur(), Decimal::new(9, 1));
//! store.replace(table);
//!
//! assert_eq!(store.get("USD", "EUR").unwrap(), Decimal::new(9, 1));
//! assert!(store.get("USD", "GBP").is_err());
//! ```

pub mod error;
pub mod store;
pub mod table;

pub use error::{FxError, FxResult};
pub use store::{RateSnapshot, RateStore, SharedRateStore};
pub use table::RateTable;
