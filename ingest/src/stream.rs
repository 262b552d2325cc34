//! Rate stream transports.
//!
//! A [`StreamConnector`] opens a subscription and hands back a
//! [`RateStream`] yielding raw snapshot payloads. Besides the Kafka
//! consumer in [`crate::kafka`], two transports ship with the crate:
//!
//! - [`TcpConnector`]: newline-delimited JSON over TCP. The client sends
//!   `SUBSCRIBE <topic>\n` once connected, then reads one payload per line.
//! - [`ChannelConnector`]: an in-process feed backed by a tokio channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::IngestConfig;
use crate::error::{IngestError, IngestResult};

/// An open subscription delivering raw snapshot payloads.
#[async_trait]
pub trait RateStream: Send {
    /// Wait for the next payload. `Ok(None)` means upstream closed the stream.
    async fn next_message(&mut self) -> IngestResult<Option<Vec<u8>>>;

    /// Close the subscription and release its resources.
    async fn close(&mut self) -> IngestResult<()>;
}

/// Opens rate stream subscriptions.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Establish a new subscription.
    async fn connect(&self) -> IngestResult<Box<dyn RateStream>>;
}

/// Connects to a newline-delimited JSON rate stream over TCP.
pub struct TcpConnector {
    address: String,
    topic: String,
    connect_timeout: Duration,
    max_message_bytes: usize,
}

impl TcpConnector {
    /// Create a connector from configuration.
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            address: config.address(),
            topic: config.topic.clone(),
            connect_timeout: config.connect_timeout,
            max_message_bytes: config.max_message_bytes,
        }
    }
}

#[async_trait]
impl StreamConnector for TcpConnector {
    fn name(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> IngestResult<Box<dyn RateStream>> {
        let socket = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                IngestError::StreamConnection(format!(
                    "timed out connecting to {} after {:?}",
                    self.address, self.connect_timeout
                ))
            })?
            .map_err(|e| {
                IngestError::StreamConnection(format!("failed to connect to {}: {}", self.address, e))
            })?;

        let (reader, mut writer) = socket.into_split();
        let subscribe = format!("SUBSCRIBE {}\n", self.topic);
        writer
            .write_all(subscribe.as_bytes())
            .await
            .map_err(|e| IngestError::StreamConnection(format!("subscribe failed: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| IngestError::StreamConnection(format!("subscribe failed: {}", e)))?;

        info!(address = %self.address, topic = %self.topic, "Subscribed to rate stream");

        Ok(Box::new(TcpRateStream {
            reader: BufReader::new(reader),
            writer,
            max_message_bytes: self.max_message_bytes,
            line: Vec::new(),
        }))
    }
}

/// Line-oriented TCP subscription.
pub struct TcpRateStream {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    max_message_bytes: usize,
    line: Vec<u8>,
}

impl TcpRateStream {
    /// Read up to `limit` bytes of the current line into `self.line`.
    async fn read_line_limited(&mut self, limit: usize) -> IngestResult<usize> {
        self.line.clear();
        (&mut self.reader)
            .take(limit as u64)
            .read_until(b'\n', &mut self.line)
            .await
            .map_err(|e| IngestError::StreamConnection(format!("read failed: {}", e)))
    }

    /// Drop the rest of an oversized line.
    async fn discard_line(&mut self) -> IngestResult<()> {
        loop {
            let read = self.read_line_limited(self.max_message_bytes).await?;
            if read == 0 || self.line.ends_with(b"\n") {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl RateStream for TcpRateStream {
    async fn next_message(&mut self) -> IngestResult<Option<Vec<u8>>> {
        loop {
            // One extra byte tells an oversized line from one that fits exactly.
            let read = self.read_line_limited(self.max_message_bytes + 1).await?;
            if read == 0 {
                return Ok(None);
            }

            let terminated = self.line.ends_with(b"\n");
            let body_len = self.line.len() - usize::from(terminated);
            if body_len > self.max_message_bytes {
                self.discard_line().await?;
                return Err(IngestError::MessageParse(format!(
                    "message exceeds {} bytes",
                    self.max_message_bytes
                )));
            }

            let payload = trim_line(&self.line);
            if payload.is_empty() {
                continue;
            }
            return Ok(Some(payload.to_vec()));
        }
    }

    async fn close(&mut self) -> IngestResult<()> {
        debug!("Closing TCP rate stream");
        self.writer
            .shutdown()
            .await
            .map_err(|e| IngestError::StreamConnection(format!("shutdown failed: {}", e)))
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end]
}

type SharedReceiver = Arc<Mutex<Option<mpsc::Receiver<Vec<u8>>>>>;

/// In-process feed backed by a tokio channel.
///
/// Only one subscription can hold the receiver at a time; it is handed back
/// when that subscription is closed or dropped, so a restarted pipeline can
/// resubscribe.
pub struct ChannelConnector {
    receiver: SharedReceiver,
}

impl ChannelConnector {
    /// Wrap an existing receiver.
    pub fn new(receiver: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            receiver: Arc::new(Mutex::new(Some(receiver))),
        }
    }

    /// Create a bounded feed and its connector.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl StreamConnector for ChannelConnector {
    fn name(&self) -> &str {
        "channel"
    }

    async fn connect(&self) -> IngestResult<Box<dyn RateStream>> {
        let receiver = self.receiver.lock().take().ok_or_else(|| {
            IngestError::StreamConnection("channel feed already has a subscriber".to_string())
        })?;

        Ok(Box::new(ChannelRateStream {
            receiver: Some(receiver),
            home: self.receiver.clone(),
        }))
    }
}

/// Subscription to a [`ChannelConnector`] feed.
pub struct ChannelRateStream {
    receiver: Option<mpsc::Receiver<Vec<u8>>>,
    home: SharedReceiver,
}

impl ChannelRateStream {
    fn release(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            *self.home.lock() = Some(receiver);
        }
    }
}

#[async_trait]
impl RateStream for ChannelRateStream {
    async fn next_message(&mut self) -> IngestResult<Option<Vec<u8>>> {
        match self.receiver.as_mut() {
            Some(receiver) => Ok(receiver.recv().await),
            None => Err(IngestError::StreamConnection("channel stream is closed".to_string())),
        }
    }

    async fn close(&mut self) -> IngestResult<()> {
        self.release();
        Ok(())
    }
}

impl Drop for ChannelRateStream {
    fn drop(&mut self) {
        self.release();
    }
}
