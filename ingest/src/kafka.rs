//! Kafka rate stream.
//!
//! Consumes the rate topic from every partition without a consumer group,
//! the same way a plain topic subscription with no group id behaves: each
//! subscription starts at the configured end of every partition and keeps
//! no committed offsets.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, SelectAll, StreamExt};
use rskafka::client::consumer::{StartOffset, StreamConsumerBuilder};
use rskafka::client::partition::UnknownTopicHandling;
use rskafka::client::ClientBuilder;
use rskafka::record::RecordAndOffset;
use tracing::{debug, info};

use crate::config::{IngestConfig, StartFrom};
use crate::error::{IngestError, IngestResult};
use crate::stream::{RateStream, StreamConnector};

/// Longest time a fetch waits on the broker for new records.
const MAX_WAIT_MS: i32 = 500;

type PartitionRecords = BoxStream<'static, Result<(i32, RecordAndOffset), String>>;

/// Subscribes to a Kafka topic through a bootstrap broker.
pub struct KafkaConnector {
    bootstrap: String,
    topic: String,
    start_from: StartFrom,
    connect_timeout: Duration,
    max_message_bytes: usize,
}

impl KafkaConnector {
    /// Create a connector from configuration.
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            bootstrap: config.address(),
            topic: config.topic.clone(),
            start_from: config.start_from,
            connect_timeout: config.connect_timeout,
            max_message_bytes: config.max_message_bytes,
        }
    }

    async fn subscribe(&self) -> IngestResult<SelectAll<PartitionRecords>> {
        let client = ClientBuilder::new(vec![self.bootstrap.clone()])
            .build()
            .await
            .map_err(|e| {
                IngestError::StreamConnection(format!(
                    "failed to connect to {}: {}",
                    self.bootstrap, e
                ))
            })?;

        let topics = client
            .list_topics()
            .await
            .map_err(|e| IngestError::StreamConnection(format!("metadata request failed: {}", e)))?;
        let partitions = topics
            .into_iter()
            .find(|topic| topic.name == self.topic)
            .map(|topic| topic.partitions)
            .filter(|partitions| !partitions.is_empty())
            .ok_or_else(|| {
                IngestError::StreamConnection(format!("topic {} not found", self.topic))
            })?;

        let mut records = SelectAll::new();
        for partition in partitions {
            let partition_client = client
                .partition_client(self.topic.clone(), partition, UnknownTopicHandling::Error)
                .await
                .map_err(|e| {
                    IngestError::StreamConnection(format!(
                        "failed to open partition {}: {}",
                        partition, e
                    ))
                })?;

            let consumer = StreamConsumerBuilder::new(Arc::new(partition_client), self.start_offset())
                .with_max_wait_ms(MAX_WAIT_MS)
                .build();

            records.push(
                consumer
                    .map(move |item| {
                        item.map(|(record, _high_watermark)| (partition, record))
                            .map_err(|e| e.to_string())
                    })
                    .boxed(),
            );
        }

        info!(
            bootstrap = %self.bootstrap,
            topic = %self.topic,
            partitions = records.len(),
            "Subscribed to Kafka topic"
        );
        Ok(records)
    }

    fn start_offset(&self) -> StartOffset {
        match self.start_from {
            StartFrom::Latest => StartOffset::Latest,
            StartFrom::Earliest => StartOffset::Earliest,
        }
    }
}

#[async_trait]
impl StreamConnector for KafkaConnector {
    fn name(&self) -> &str {
        &self.bootstrap
    }

    async fn connect(&self) -> IngestResult<Box<dyn RateStream>> {
        let records = tokio::time::timeout(self.connect_timeout, self.subscribe())
            .await
            .map_err(|_| {
                IngestError::StreamConnection(format!(
                    "timed out subscribing to {} at {} after {:?}",
                    self.topic, self.bootstrap, self.connect_timeout
                ))
            })??;

        Ok(Box::new(KafkaRateStream {
            records,
            max_message_bytes: self.max_message_bytes,
        }))
    }
}

/// Records of every partition of the topic, merged as they arrive.
///
/// Each partition is read in offset order; partitions interleave freely.
pub struct KafkaRateStream {
    records: SelectAll<PartitionRecords>,
    max_message_bytes: usize,
}

#[async_trait]
impl RateStream for KafkaRateStream {
    async fn next_message(&mut self) -> IngestResult<Option<Vec<u8>>> {
        match self.records.next().await {
            Some(Ok((partition, record))) => {
                debug!(partition, offset = record.offset, "Received rate record");
                record_payload(record, self.max_message_bytes).map(Some)
            }
            Some(Err(e)) => Err(IngestError::StreamConnection(format!("fetch failed: {}", e))),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> IngestResult<()> {
        debug!("Closing Kafka rate stream");
        self.records = SelectAll::new();
        Ok(())
    }
}

/// Extract the JSON payload of one record.
fn record_payload(record: RecordAndOffset, max_message_bytes: usize) -> IngestResult<Vec<u8>> {
    let offset = record.offset;
    let value = record.record.value.ok_or_else(|| {
        IngestError::MessageParse(format!("record at offset {} has no value", offset))
    })?;

    if value.len() > max_message_bytes {
        return Err(IngestError::MessageParse(format!(
            "record at offset {} exceeds {} bytes",
            offset, max_message_bytes
        )));
    }

    Ok(value)
}
