//! The ingestion pipeline: stream subscription, expansion, store swap.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use ratefeed_fx::{RateStore, SharedRateStore};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{IngestError, IngestResult};
use crate::message::SnapshotMessage;
use crate::metrics::{IngestMetrics, SharedMetrics};
use crate::state::PipelineState;
use crate::stream::StreamConnector;

/// Parse one payload, expand it and publish the result to `store`.
///
/// Returns the new store version. On error the store is left untouched:
/// the payload was not a JSON object, or it had entries and none of them
/// was valid. Individual bad entries are logged and skipped.
pub fn apply_message(
    store: &RateStore,
    metrics: &IngestMetrics,
    payload: &[u8],
) -> IngestResult<u64> {
    metrics.message_received();

    let message = match SnapshotMessage::parse(payload) {
        Ok(message) => message,
        Err(e) => {
            metrics.message_dropped(0);
            return Err(e);
        }
    };

    let expansion = message.expand();
    for skipped in &expansion.skipped {
        warn!(error = %skipped, code = skipped.error_code(), "Skipping rate entry");
    }

    let skipped = expansion.skipped.len();
    if expansion.applied == 0 && !message.is_empty() {
        metrics.message_dropped(skipped);
        return Err(IngestError::MessageParse(format!(
            "none of the {} entries is valid",
            message.len()
        )));
    }

    let applied = expansion.applied;
    let version = store.replace(expansion.table);
    metrics.message_applied(applied, skipped, version);
    debug!(version, applied, skipped, "Applied rate snapshot");

    Ok(version)
}

/// Long-lived background task feeding the rate store from a stream.
///
/// The owner calls [`start`](Self::start) at startup and
/// [`stop`](Self::stop) at shutdown. A fatal stream failure ends the run
/// with [`PipelineState::Failed`] and is returned from
/// [`join`](Self::join); the owner decides whether to start again.
pub struct IngestPipeline {
    store: SharedRateStore,
    connector: Arc<dyn StreamConnector>,
    metrics: SharedMetrics,
    state: SharedRunState,
    run: Mutex<Option<Run>>,
}

/// Pipeline state tagged with the run that last set it.
#[derive(Debug)]
struct RunState {
    generation: u64,
    state: PipelineState,
}

type SharedRunState = Arc<RwLock<RunState>>;

/// Outcome of a run, published once the worker has released its stream.
type RunOutcome = Option<IngestResult<()>>;

/// Handles to the most recently started run.
#[derive(Clone)]
struct Run {
    shutdown_tx: mpsc::Sender<()>,
    done_rx: watch::Receiver<RunOutcome>,
}

impl Run {
    fn is_finished(&self) -> bool {
        self.done_rx.borrow().is_some()
    }

    async fn wait(mut self) -> IngestResult<()> {
        loop {
            let outcome = self.done_rx.borrow_and_update().clone();
            if let Some(outcome) = outcome {
                return outcome;
            }
            if self.done_rx.changed().await.is_err() {
                let outcome = self.done_rx.borrow().clone();
                return outcome.unwrap_or_else(|| {
                    Err(IngestError::Task("ingestion run ended without an outcome".to_string()))
                });
            }
        }
    }
}

impl IngestPipeline {
    /// Create a pipeline publishing into `store`.
    pub fn new(store: SharedRateStore, connector: Arc<dyn StreamConnector>) -> Self {
        Self::with_metrics(store, connector, Arc::new(IngestMetrics::new()))
    }

    /// Create a pipeline reporting into an existing metrics instance.
    pub fn with_metrics(
        store: SharedRateStore,
        connector: Arc<dyn StreamConnector>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            store,
            connector,
            metrics,
            state: Arc::new(RwLock::new(RunState {
                generation: 0,
                state: PipelineState::Idle,
            })),
            run: Mutex::new(None),
        }
    }

    /// Spawn the ingestion task. Must be called from within a tokio runtime.
    ///
    /// Fails with [`IngestError::AlreadyRunning`] until the previous run has
    /// released its stream, even while another caller is joining it.
    #[instrument(skip(self))]
    pub fn start(&self) -> IngestResult<()> {
        let mut run = self.run.lock();
        if run.as_ref().is_some_and(|current| !current.is_finished()) {
            return Err(IngestError::AlreadyRunning);
        }

        let generation = {
            let mut state = self.state.write();
            state.generation += 1;
            state.state = PipelineState::Connecting;
            state.generation
        };

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = watch::channel(None);

        let worker = Worker {
            generation,
            store: self.store.clone(),
            connector: self.connector.clone(),
            metrics: self.metrics.clone(),
            state: self.state.clone(),
        };
        let handle = tokio::spawn(worker.run(shutdown_rx));
        tokio::spawn(supervise(
            handle,
            generation,
            self.state.clone(),
            self.metrics.clone(),
            done_tx,
        ));

        *run = Some(Run {
            shutdown_tx,
            done_rx,
        });

        info!(
            source = self.connector.name(),
            generation, "Ingestion pipeline started"
        );
        Ok(())
    }

    /// Cancel the ingestion task and wait for it to release the stream.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> IngestResult<()> {
        info!("Stopping ingestion pipeline");

        let run = self.run.lock().clone();
        if let Some(run) = run {
            // The task may already be gone.
            let _ = run.shutdown_tx.send(()).await;

            if let Err(e) = run.wait().await {
                warn!(error = %e, "Ingestion pipeline had already failed");
            }
        }

        self.state.write().state = PipelineState::Stopped;
        info!("Ingestion pipeline stopped");
        Ok(())
    }

    /// Wait for the current run to end and return its outcome.
    ///
    /// Returns `Ok(())` at once if the pipeline was never started. Any
    /// number of callers may join the same run.
    pub async fn join(&self) -> IngestResult<()> {
        let run = self.run.lock().clone();
        match run {
            Some(run) => run.wait().await,
            None => Ok(()),
        }
    }

    /// Get the current pipeline state.
    pub fn state(&self) -> PipelineState {
        self.state.read().state
    }

    /// Check if a run is in progress.
    pub fn is_running(&self) -> bool {
        self.state().is_active()
    }

    /// The store this pipeline publishes into.
    pub fn store(&self) -> &SharedRateStore {
        &self.store
    }

    /// Ingestion metrics.
    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }
}

/// Publish the outcome of one run, turning a panic into a failure.
async fn supervise(
    handle: JoinHandle<IngestResult<()>>,
    generation: u64,
    state: SharedRunState,
    metrics: SharedMetrics,
    done_tx: watch::Sender<RunOutcome>,
) {
    let outcome = match handle.await {
        Ok(result) => result,
        Err(e) => {
            metrics.stream_failed();
            set_state(&state, generation, PipelineState::Failed);
            error!(error = %e, generation, "Ingestion task did not finish cleanly");
            Err(IngestError::Task(e.to_string()))
        }
    };
    done_tx.send_replace(Some(outcome));
}

/// Record `next` unless a newer run has started since `generation`.
fn set_state(state: &RwLock<RunState>, generation: u64, next: PipelineState) {
    let mut state = state.write();
    if state.generation == generation {
        state.state = next;
    }
}

/// State owned by one spawned run.
struct Worker {
    generation: u64,
    store: SharedRateStore,
    connector: Arc<dyn StreamConnector>,
    metrics: SharedMetrics,
    state: SharedRunState,
}

impl Worker {
    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) -> IngestResult<()> {
        info!(source = self.connector.name(), "Connecting to rate stream");

        let connected = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                self.set_state(PipelineState::Stopped);
                return Ok(());
            }
            result = self.connector.connect() => result,
        };

        let mut stream = match connected {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail(e)),
        };

        self.set_state(PipelineState::Running);
        info!(source = self.connector.name(), "Rate stream running");

        // A closed shutdown channel means the owner is gone; stop as well.
        let outcome = loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break Ok(()),
                next = stream.next_message() => match next {
                    Ok(Some(payload)) => {
                        if let Err(e) = apply_message(&self.store, &self.metrics, &payload) {
                            error!(error = %e, code = e.error_code(), "Dropping rate message");
                        }
                    }
                    Ok(None) => break Err(IngestError::StreamClosed),
                    Err(e) if e.is_fatal() => break Err(e),
                    Err(e) => {
                        self.metrics.message_received();
                        self.metrics.message_dropped(0);
                        error!(error = %e, code = e.error_code(), "Dropping rate message");
                    }
                },
            }
        };

        if let Err(e) = stream.close().await {
            warn!(error = %e, "Failed to close rate stream");
        }

        match outcome {
            Ok(()) => {
                self.set_state(PipelineState::Stopped);
                info!(version = self.store.version(), "Rate stream closed on shutdown");
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn set_state(&self, state: PipelineState) {
        set_state(&self.state, self.generation, state);
    }

    fn fail(&self, e: IngestError) -> IngestError {
        self.metrics.stream_failed();
        self.set_state(PipelineState::Failed);
        error!(
            error = %e,
            code = e.error_code(),
            version = self.store.version(),
            "Rate stream failed, rate table is no longer updating"
        );
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use crate::stream::{ChannelConnector, TcpConnector};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn setup() -> (mpsc::Sender<Vec<u8>>, IngestPipeline) {
        let (tx, connector) = ChannelConnector::channel(16);
        let pipeline = IngestPipeline::new(Arc::new(RateStore::new()), Arc::new(connector));
        (tx, pipeline)
    }

    async fn send(tx: &mpsc::Sender<Vec<u8>>, payload: &str) {
        tx.send(payload.as_bytes().to_vec()).await.unwrap();
    }

    async fn wait_for_version(store: &RateStore, version: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.version() < version {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("store was not updated in time");
    }

    async fn wait_for_state(pipeline: &IngestPipeline, state: PipelineState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while pipeline.state() != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pipeline did not reach the expected state");
    }

    #[tokio::test]
    async fn test_single_pair_is_published_both_ways() {
        let (tx, pipeline) = setup();
        pipeline.start().unwrap();

        send(&tx, r#"{"USDEUR": "0.9"}"#).await;
        wait_for_version(pipeline.store(), 1).await;

        let store = pipeline.store();
        assert_eq!(store.get("USD", "EUR").unwrap(), dec!(0.9));
        assert_eq!(store.get("EUR", "USD").unwrap(), Decimal::ONE / dec!(0.9));
        assert_eq!(pipeline.state(), PipelineState::Running);

        pipeline.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_messages_replace_instead_of_merge() {
        let (tx, pipeline) = setup();
        pipeline.start().unwrap();

        send(&tx, r#"{"USDEUR": "0.9", "USDGBP": "0.8"}"#).await;
        send(&tx, r#"{"USDEUR": "0.95"}"#).await;
        wait_for_version(pipeline.store(), 2).await;

        let store = pipeline.store();
        assert_eq!(store.get("USD", "EUR").unwrap(), dec!(0.95));
        assert!(store.get("USD", "GBP").is_err());
        assert!(store.get("GBP", "USD").is_err());

        pipeline.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_entry_does_not_halt_ingestion() {
        let (tx, pipeline) = setup();
        pipeline.start().unwrap();

        send(&tx, r#"{"US": "1.0", "USDEUR": "0.9"}"#).await;
        send(&tx, r#"{"USDJPY": "150"}"#).await;
        wait_for_version(pipeline.store(), 2).await;

        assert_eq!(pipeline.store().get("USD", "JPY").unwrap(), dec!(150));

        let metrics = pipeline.metrics().snapshot();
        assert_eq!(metrics.messages_applied, 2);
        assert_eq!(metrics.entries_applied, 2);
        assert_eq!(metrics.entries_skipped, 1);

        pipeline.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unparseable_message_keeps_last_good_table() {
        let (tx, pipeline) = setup();
        pipeline.start().unwrap();

        send(&tx, r#"{"USDEUR": "0.9"}"#).await;
        send(&tx, "not json").await;
        send(&tx, "[1, 2, 3]").await;
        send(&tx, r#"{"USDEUR": "0"}"#).await;
        send(&tx, r#"{"USDGBP": "0.8"}"#).await;
        wait_for_version(pipeline.store(), 2).await;

        let store = pipeline.store();
        assert_eq!(store.version(), 2);
        assert_eq!(store.get("USD", "GBP").unwrap(), dec!(0.8));

        let metrics = pipeline.metrics().snapshot();
        assert_eq!(metrics.messages_received, 5);
        assert_eq!(metrics.messages_dropped, 3);
        assert_eq!(pipeline.state(), PipelineState::Running);

        pipeline.stop().await.unwrap();
    }

    #[test]
    fn test_apply_message_is_idempotent() {
        let store = RateStore::new();
        let metrics = IngestMetrics::new();
        let payload = br#"{"USDEUR": "0.9", "USDGBP": "0.8", "EURJPY": 162.5}"#;

        apply_message(&store, &metrics, payload).unwrap();
        let once = store.snapshot();
        apply_message(&store, &metrics, payload).unwrap();
        let twice = store.snapshot();

        assert_eq!(once.table(), twice.table());
        assert_eq!(twice.version(), 2);
    }

    #[test]
    fn test_apply_empty_object_clears_table() {
        let store = RateStore::new();
        let metrics = IngestMetrics::new();

        apply_message(&store, &metrics, br#"{"USDEUR": "0.9"}"#).unwrap();
        let version = apply_message(&store, &metrics, b"{}").unwrap();

        assert_eq!(version, 2);
        assert!(store.snapshot().table().is_empty());
    }

    #[test]
    fn test_apply_all_invalid_entries_is_dropped() {
        let store = RateStore::new();
        let metrics = IngestMetrics::new();

        apply_message(&store, &metrics, br#"{"USDEUR": "0.9"}"#).unwrap();
        let result = apply_message(&store, &metrics, br#"{"USDEUR": "-1", "X": "2"}"#);

        assert!(matches!(result, Err(IngestError::MessageParse(_))));
        assert_eq!(store.version(), 1);
        assert_eq!(store.get("USD", "EUR").unwrap(), dec!(0.9));
        assert_eq!(metrics.snapshot().entries_skipped, 2);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let (_tx, pipeline) = setup();
        assert_eq!(pipeline.state(), PipelineState::Idle);

        pipeline.start().unwrap();
        wait_for_state(&pipeline, PipelineState::Running).await;
        assert!(pipeline.is_running());
        assert!(matches!(pipeline.start(), Err(IngestError::AlreadyRunning)));

        pipeline.stop().await.unwrap();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(pipeline.join().await.is_ok());
    }

    #[tokio::test]
    async fn test_start_while_joined_is_rejected() {
        let (_tx, pipeline) = setup();
        let pipeline = Arc::new(pipeline);
        pipeline.start().unwrap();
        wait_for_state(&pipeline, PipelineState::Running).await;

        let joiner = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.join().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(pipeline.start(), Err(IngestError::AlreadyRunning)));
        assert_eq!(pipeline.state(), PipelineState::Running);

        pipeline.stop().await.unwrap();
        assert!(joiner.await.unwrap().is_ok());
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_while_joined_releases_stream() {
        let (_tx, connector) = ChannelConnector::channel(4);
        let connector = Arc::new(connector);
        let pipeline = Arc::new(IngestPipeline::new(
            Arc::new(RateStore::new()),
            connector.clone(),
        ));
        pipeline.start().unwrap();
        wait_for_state(&pipeline, PipelineState::Running).await;

        let joiner = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.join().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pipeline.stop().await.unwrap();

        // The subscription was handed back before stop returned.
        assert!(connector.connect().await.is_ok());
        assert!(joiner.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_stop_closes_tcp_subscription() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = IngestConfig {
            port: listener.local_addr().unwrap().port(),
            topic: "rates".to_string(),
            ..Default::default()
        };
        let pipeline = IngestPipeline::new(
            Arc::new(RateStore::new()),
            Arc::new(TcpConnector::new(&config)),
        );
        pipeline.start().unwrap();

        let (socket, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = socket.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "SUBSCRIBE rates\n");

        writer.write_all(b"{\"USDEUR\": \"0.9\"}\n").await.unwrap();
        wait_for_version(pipeline.store(), 1).await;

        pipeline.stop().await.unwrap();
        assert_eq!(pipeline.state(), PipelineState::Stopped);

        // The client side is shut down once stop returns.
        line.clear();
        let read = tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .expect("subscription was not closed")
            .unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_upstream_close_fails_pipeline() {
        let (tx, pipeline) = setup();
        pipeline.start().unwrap();

        send(&tx, r#"{"USDEUR": "0.9"}"#).await;
        drop(tx);

        let result = pipeline.join().await;
        assert!(matches!(result, Err(IngestError::StreamClosed)));
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert_eq!(pipeline.metrics().snapshot().stream_failures, 1);

        // The last good table is still served.
        assert_eq!(pipeline.store().get("USD", "EUR").unwrap(), dec!(0.9));

        // The owner may start again after a failure.
        pipeline.start().unwrap();
        assert!(matches!(pipeline.join().await, Err(IngestError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_connection_failure_is_surfaced() {
        let (_tx, connector) = ChannelConnector::channel(1);
        let connector = Arc::new(connector);
        // Hold the only subscription so the pipeline cannot connect.
        let _held = connector.connect().await.unwrap();

        let pipeline = IngestPipeline::new(Arc::new(RateStore::new()), connector);
        pipeline.start().unwrap();

        let result = pipeline.join().await;
        assert!(matches!(result, Err(IngestError::StreamConnection(_))));
        assert_eq!(pipeline.state(), PipelineState::Failed);
    }
}
