//! Sink multiplexer: fans each log line out to every configured destination
//!
//! The local stream is always present. The optional remote destination is an
//! indexed store fed through a bounded queue and a background batch writer:
//! - Records are enqueued without waiting; a full queue drops the newest record
//! - Batches flush on record count, accumulated bytes or a timer
//! - Each record targets a dated index, `<base>-<YYYY-MM-DD>`
//!
//! Neither destination writes on the caller's task: `emit` only enqueues.

use chrono::NaiveDate;
use futures::future::{BoxFuture, FutureExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::RemoteStoreConfig;
use crate::error::TelemetryError;
use crate::metrics;
use crate::record::LogLine;

/// A destination for log lines.
///
/// `emit` runs on the request-completion path and must not wait on I/O that
/// can stall, such as network writes.
pub trait RecordSink: Send + Sync {
    fn name(&self) -> &'static str;

    fn emit(&self, line: &LogLine);

    /// Push out anything buffered. Best effort.
    fn flush(&self) -> BoxFuture<'_, Result<(), TelemetryError>> {
        async { Ok::<(), TelemetryError>(()) }.boxed()
    }

    /// Flush and stop accepting lines
    fn close(&self) -> BoxFuture<'_, Result<(), TelemetryError>> {
        self.flush()
    }
}

#[derive(Debug)]
enum StreamMessage {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// Line-oriented JSON stream, stdout by default
///
/// Lines are handed to a background task that owns the writer.
#[derive(Clone)]
pub struct StreamSink {
    sender: mpsc::Sender<StreamMessage>,
}

impl StreamSink {
    /// Must be called inside a tokio runtime
    pub fn stdout(queue_capacity: usize) -> Self {
        let (sink, _handle) = Self::spawn(tokio::io::stdout(), queue_capacity);
        sink
    }

    /// Spawn the writer task over `writer`. The task exits once every handle
    /// is dropped.
    pub fn spawn<W>(writer: W, queue_capacity: usize) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let handle = tokio::spawn(stream_writer_task(writer, rx));
        (Self { sender: tx }, handle)
    }

    fn try_enqueue(&self, line: &LogLine) -> Result<(), TelemetryError> {
        let json = line.to_json()?;
        self.sender
            .try_send(StreamMessage::Line(json))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TelemetryError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => TelemetryError::QueueClosed,
            })
    }
}

impl RecordSink for StreamSink {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn emit(&self, line: &LogLine) {
        match self.try_enqueue(line) {
            Ok(()) => {}
            Err(TelemetryError::QueueFull) => {
                metrics::record_sink_dropped(self.name(), "queue_full", 1);
            }
            Err(e) => {
                metrics::record_sink_dropped(self.name(), "enqueue_failed", 1);
                tracing::warn!(error = %e, "Failed to queue log line for local stream");
            }
        }
    }

    fn flush(&self) -> BoxFuture<'_, Result<(), TelemetryError>> {
        async move {
            let (ack_tx, ack_rx) = oneshot::channel();
            self.sender
                .send(StreamMessage::Flush(ack_tx))
                .await
                .map_err(|_| TelemetryError::QueueClosed)?;
            ack_rx.await.map_err(|_| TelemetryError::QueueClosed)
        }
        .boxed()
    }
}

async fn stream_writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<StreamMessage>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        match msg {
            StreamMessage::Line(mut json) => {
                json.push('\n');
                let result = match writer.write_all(json.as_bytes()).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => metrics::record_sink_written("stream", 1),
                    Err(e) => {
                        metrics::record_sink_dropped("stream", "write_failed", 1);
                        tracing::warn!(error = %e, "Failed to write log line to local stream");
                    }
                }
            }
            StreamMessage::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

/// Index name for a record written on `date`
pub fn index_name(base: &str, date: NaiveDate) -> String {
    format!("{}-{}", base.to_lowercase(), date.format("%Y-%m-%d"))
}

/// One bulk-index operation
#[derive(Debug)]
struct Document {
    index: String,
    body: String,
}

impl Document {
    fn encoded_len(&self) -> usize {
        self.index.len() + self.body.len()
    }
}

#[derive(Debug)]
enum WriterMessage {
    Document(Document),
    Flush(oneshot::Sender<()>),
    /// Final flush, then the writer exits
    Close(oneshot::Sender<()>),
}

/// Handle to the remote indexed store writer.
///
/// Cloning shares the same queue and background task.
#[derive(Clone)]
pub struct RemoteIndexSink {
    sender: mpsc::Sender<WriterMessage>,
    base_index: Arc<str>,
}

impl RemoteIndexSink {
    /// Spawn the background writer task
    ///
    /// # Arguments
    ///
    /// * `config` - Store address, credentials, index base and batching knobs
    /// * `queue_capacity` - Maximum records waiting for the writer
    pub fn spawn(
        config: RemoteStoreConfig,
        queue_capacity: usize,
    ) -> Result<(Self, JoinHandle<()>), TelemetryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;

        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let base_index: Arc<str> = Arc::from(config.index.as_str());

        tracing::info!(
            uri = %config.uri,
            index = %config.index,
            batch_size = config.batch_size,
            "Remote telemetry sink started"
        );

        let handle = tokio::spawn(async move {
            writer_task(BulkClient { client, config }, rx).await;
        });

        Ok((
            Self {
                sender: tx,
                base_index,
            },
            handle,
        ))
    }

    /// Queue a line without waiting
    pub fn try_enqueue(&self, line: &LogLine) -> Result<(), TelemetryError> {
        let document = Document {
            index: index_name(&self.base_index, line.date()),
            body: line.to_json()?,
        };

        self.sender
            .try_send(WriterMessage::Document(document))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TelemetryError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => TelemetryError::QueueClosed,
            })
    }

    /// Flush everything queued before this call and wait for the attempt
    pub async fn flush_pending(&self) -> Result<(), TelemetryError> {
        self.request(WriterMessage::Flush).await
    }

    /// Flush everything queued before this call, then stop the writer.
    /// Lines emitted afterwards are dropped as `QueueClosed`.
    pub async fn close_writer(&self) -> Result<(), TelemetryError> {
        self.request(WriterMessage::Close).await
    }

    async fn request(
        &self,
        message: fn(oneshot::Sender<()>) -> WriterMessage,
    ) -> Result<(), TelemetryError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.sender
            .send(message(ack_tx))
            .await
            .map_err(|_| TelemetryError::QueueClosed)?;
        ack_rx.await.map_err(|_| TelemetryError::QueueClosed)
    }
}

impl RecordSink for RemoteIndexSink {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn emit(&self, line: &LogLine) {
        match self.try_enqueue(line) {
            Ok(()) => {}
            Err(TelemetryError::QueueFull) => {
                metrics::record_sink_dropped(self.name(), "queue_full", 1);
                tracing::debug!("Remote telemetry queue full, dropping newest record");
            }
            Err(e) => {
                metrics::record_sink_dropped(self.name(), "enqueue_failed", 1);
                tracing::warn!(error = %e, "Failed to queue record for remote store");
            }
        }
    }

    fn flush(&self) -> BoxFuture<'_, Result<(), TelemetryError>> {
        self.flush_pending().boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<(), TelemetryError>> {
        self.close_writer().boxed()
    }
}

struct BulkClient {
    client: reqwest::Client,
    config: RemoteStoreConfig,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
}

impl BulkClient {
    fn bulk_url(&self) -> String {
        let shards: String =
            url::form_urlencoded::byte_serialize(self.config.wait_for_active_shards.as_bytes())
                .collect();
        format!(
            "{}/_bulk?wait_for_active_shards={}",
            self.config.uri.trim_end_matches('/'),
            shards
        )
    }

    async fn send(&self, batch: &[Document]) -> Result<(), TelemetryError> {
        let mut body = String::new();
        for doc in batch {
            let action = serde_json::json!({ "index": { "_index": doc.index } });
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&doc.body);
            body.push('\n');
        }

        let mut request = self
            .client
            .post(self.bulk_url())
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body);

        if let Some(user) = &self.config.user {
            request = request.basic_auth(user, self.config.password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TelemetryError::RemoteRejected {
                status: status.as_u16(),
                message,
            });
        }

        let bulk: BulkResponse = response.json().await?;
        if bulk.errors {
            return Err(TelemetryError::RemoteRejected {
                status: status.as_u16(),
                message: "bulk response reported item errors".to_string(),
            });
        }

        Ok(())
    }
}

/// Background writer task
///
/// Batches documents and writes them to the store. Exits after a final flush
/// on `Close` or once every sender is gone.
async fn writer_task(client: BulkClient, mut rx: mpsc::Receiver<WriterMessage>) {
    let batch_size = client.config.batch_size.max(1);
    let flush_bytes = client.config.flush_bytes;
    let mut batch: Vec<Document> = Vec::with_capacity(batch_size);
    let mut batch_bytes = 0usize;

    let mut flush_timer =
        tokio::time::interval(Duration::from_millis(client.config.flush_interval_ms.max(1)));
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(WriterMessage::Document(doc)) => {
                        batch_bytes += doc.encoded_len();
                        batch.push(doc);

                        if batch.len() >= batch_size || batch_bytes >= flush_bytes {
                            flush_batch(&client, &mut batch).await;
                            batch_bytes = 0;
                        }
                    }
                    Some(WriterMessage::Flush(ack)) => {
                        flush_batch(&client, &mut batch).await;
                        batch_bytes = 0;
                        let _ = ack.send(());
                    }
                    Some(WriterMessage::Close(ack)) => {
                        flush_batch(&client, &mut batch).await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        flush_batch(&client, &mut batch).await;
                        break;
                    }
                }
            }

            _ = flush_timer.tick() => {
                if !batch.is_empty() {
                    flush_batch(&client, &mut batch).await;
                    batch_bytes = 0;
                }
            }
        }
    }

    tracing::info!("Remote telemetry writer shutting down");
}

async fn flush_batch(client: &BulkClient, batch: &mut Vec<Document>) {
    if batch.is_empty() {
        return;
    }

    let count = batch.len();
    let start = Instant::now();

    match client.send(batch).await {
        Ok(()) => {
            let elapsed = start.elapsed();
            tracing::debug!(
                count = count,
                duration_ms = elapsed.as_millis() as u64,
                "Flushed telemetry batch"
            );
            metrics::record_sink_written("remote", count as u64);
            metrics::record_flush_duration("remote", elapsed);
        }
        Err(e) => {
            // No retry queue: the batch is lost, the local stream still has it
            tracing::error!(
                error = %e,
                count = count,
                "Failed to flush telemetry batch to remote store"
            );
            metrics::record_sink_dropped("remote", "flush_failed", count as u64);
        }
    }

    batch.clear();
}

/// Every active destination for log lines
#[derive(Clone)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn RecordSink>>,
}

impl SinkSet {
    pub fn new(sinks: Vec<Arc<dyn RecordSink>>) -> Self {
        Self { sinks }
    }

    /// Local stdout stream, plus the remote store when configured.
    ///
    /// Must be called inside a tokio runtime.
    pub fn configure(
        remote: Option<RemoteStoreConfig>,
        queue_capacity: usize,
    ) -> Result<(Self, Option<JoinHandle<()>>), TelemetryError> {
        let mut sinks: Vec<Arc<dyn RecordSink>> =
            vec![Arc::new(StreamSink::stdout(queue_capacity))];
        let mut handle = None;

        if let Some(remote) = remote {
            let (sink, task) = RemoteIndexSink::spawn(remote, queue_capacity)?;
            sinks.push(Arc::new(sink));
            handle = Some(task);
        }

        Ok((Self { sinks }, handle))
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    pub fn emit(&self, line: &LogLine) {
        for sink in &self.sinks {
            sink.emit(line);
        }
    }

    /// Flush every destination, giving up after `timeout`
    pub async fn flush(&self, timeout: Duration) {
        for sink in &self.sinks {
            settle(sink.name(), "flush", tokio::time::timeout(timeout, sink.flush()).await);
        }
    }

    /// Final flush of every destination, which then stops accepting lines
    pub async fn close(&self, timeout: Duration) {
        for sink in &self.sinks {
            settle(sink.name(), "close", tokio::time::timeout(timeout, sink.close()).await);
        }
    }
}

fn settle(
    sink: &'static str,
    action: &'static str,
    outcome: Result<Result<(), TelemetryError>, tokio::time::error::Elapsed>,
) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(sink, action, error = %e, "Sink operation failed");
        }
        Err(_) => {
            tracing::warn!(sink, action, "Sink operation timed out");
        }
    }
}
