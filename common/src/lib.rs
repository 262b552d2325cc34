//! Ratefeed Common Types
//!
//! Currency codes, currency pairs and monetary amounts shared by the rate
//! store and the ingestion pipeline.

pub mod monetary;

pub use monetary::*;
