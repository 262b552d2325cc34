//! Ratefeed Ingestion
//!
//! Consumes rate snapshot messages from a stream, expands every pair into
//! both directions and publishes each message to a [`RateStore`] as one
//! atomic table swap.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ratefeed_fx::RateStore;
//! use ratefeed_ingest::{IngestConfig, IngestPipeline, KafkaConnector};
//!
//! let config = IngestConfig::from_env();
//! let store = Arc::new(RateStore::new());
//! let pipeline = IngestPipeline::new(store.clone(), Arc::new(KafkaConnector::new(&config)));
//!
//! pipeline.start()?;
//! // Request handlers read from `store` concurrently.
//! let rate = store.get("USD", "EUR")?;
//! pipeline.stop().await?;
//! ```
//!
//! [`RateStore`]: ratefeed_fx::RateStore

pub mod config;
pub mod error;
pub mod kafka;
pub mod message;
pub mod metrics;
pub mod pipeline;
pub mod state;
pub mod stream;

pub use config::{IngestConfig, StartFrom, Transport};
pub use error::{IngestError, IngestResult};
pub use kafka::KafkaConnector;
pub use message::{Expansion, SnapshotMessage};
pub use metrics::{IngestMetrics, IngestMetricsSnapshot, SharedMetrics};
pub use pipeline::{apply_message, IngestPipeline};
pub use state::PipelineState;
pub use stream::{ChannelConnector, RateStream, StreamConnector, TcpConnector};
