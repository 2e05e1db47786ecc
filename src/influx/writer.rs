use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow, bail};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::InfluxConfig;
use crate::influx::{InfluxClient, Point, is_permanent_rejection};

const QUEUE_CAPACITY: usize = 1024;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Destination of the upload stage.
pub trait PointSink: Send + 'static {
    /// Queues a point without waiting for it to reach the store.
    fn write(&mut self, point: Point) -> impl Future<Output = Result<()>> + Send;

    /// Writes everything queued so far and waits for the outcome.
    fn flush(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn close(self) -> impl Future<Output = ()> + Send
    where
        Self: Sized;
}

#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    pub batch_size: usize,

    pub flush_interval: Duration,

    /// Upper bound on points kept for retry while the store is unreachable.
    pub retry_buffer_limit: usize,
}

impl From<&InfluxConfig> for WriteOptions {
    fn from(config: &InfluxConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            flush_interval: config.flush_interval(),
            retry_buffer_limit: config.retry_buffer_limit,
        }
    }
}

#[derive(Debug)]
enum WriteCommand {
    Line(String),
    Flush(oneshot::Sender<Result<()>>),
}

/// Batching, non-blocking writer backed by a background task.
///
/// Points are sent in batches of `batch_size`, or every `flush_interval`
/// when fewer are pending. Failed batches stay buffered and are retried with
/// exponential backoff.
#[derive(Debug)]
pub struct InfluxWriter {
    tx: mpsc::Sender<WriteCommand>,
    worker: JoinHandle<()>,
}

impl InfluxWriter {
    pub fn spawn(client: InfluxClient, options: WriteOptions) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let batcher = Batcher::new(client, options);
        let worker = tokio::spawn(run_writer(batcher, rx, options.flush_interval));
        Self { tx, worker }
    }
}

impl PointSink for InfluxWriter {
    async fn write(&mut self, point: Point) -> Result<()> {
        let Some(line) = point.to_line_protocol() else {
            tracing::warn!(measurement = %point.measurement, "point has no finite fields, skipping");
            return Ok(());
        };
        self.tx
            .send(WriteCommand::Line(line))
            .await
            .map_err(|_| anyhow!("influx writer stopped"))
    }

    async fn flush(&mut self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(WriteCommand::Flush(done_tx))
            .await
            .map_err(|_| anyhow!("influx writer stopped"))?;
        done_rx.await.context("influx writer stopped during flush")?
    }

    async fn close(self) {
        drop(self.tx);
        if let Err(err) = self.worker.await {
            tracing::error!(error = %err, "influx writer task failed");
        }
    }
}

async fn run_writer(
    mut batcher: Batcher,
    mut rx: mpsc::Receiver<WriteCommand>,
    flush_interval: Duration,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if batcher.is_empty() || !batcher.ready() {
                    continue;
                }
                if let Err(err) = batcher.flush().await {
                    tracing::warn!(pending = batcher.len(), "flush on interval failed: {err:#}");
                }
            }
            cmd = rx.recv() => {
                match cmd {
                    Some(WriteCommand::Line(line)) => {
                        batcher.push(line);
                        if batcher.batch_full() && batcher.ready() {
                            if let Err(err) = batcher.flush().await {
                                tracing::warn!(pending = batcher.len(), "flush on batch size failed: {err:#}");
                            }
                        }
                    }
                    Some(WriteCommand::Flush(done)) => {
                        let _ = done.send(batcher.flush().await);
                    }
                    None => {
                        if !batcher.is_empty() {
                            tracing::warn!(dropped = batcher.len(), "influx writer closed with unsent points");
                        }
                        break;
                    }
                }
            }
        }
    }
}

struct Batcher {
    client: InfluxClient,
    buffer: VecDeque<String>,
    batch_size: usize,
    retry_buffer_limit: usize,
    base_delay: Duration,
    failures: u32,
    retry_at: Option<Instant>,
}

impl Batcher {
    fn new(client: InfluxClient, options: WriteOptions) -> Self {
        let batch_size = options.batch_size.max(1);
        Self {
            client,
            buffer: VecDeque::with_capacity(batch_size),
            batch_size,
            retry_buffer_limit: options.retry_buffer_limit.max(batch_size),
            base_delay: options.flush_interval,
            failures: 0,
            retry_at: None,
        }
    }

    fn len(&self) -> usize {
        self.buffer.len()
    }

    fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn batch_full(&self) -> bool {
        self.buffer.len() >= self.batch_size
    }

    fn ready(&self) -> bool {
        self.retry_at.is_none_or(|at| Instant::now() >= at)
    }

    fn push(&mut self, line: String) {
        self.buffer.push_back(line);
        let excess = self.buffer.len().saturating_sub(self.retry_buffer_limit);
        if excess > 0 {
            self.buffer.drain(..excess);
            tracing::warn!(dropped = excess, "retry buffer full, dropped oldest points");
        }
    }

    /// Sends everything buffered. Batches the server refuses outright are
    /// dropped so they cannot block later points; any other failure keeps
    /// the batch and backs off.
    async fn flush(&mut self) -> Result<()> {
        let mut rejected = 0;

        while !self.buffer.is_empty() {
            let len = self.batch_size.min(self.buffer.len());
            let batch: Vec<String> = self.buffer.iter().take(len).cloned().collect();

            match self.client.write_lines(&batch).await {
                Ok(()) => {
                    self.failures = 0;
                    self.retry_at = None;
                    tracing::debug!(len, "wrote batch");
                }
                Err(err) if is_permanent_rejection(&err) => {
                    rejected += len;
                    tracing::error!(dropped = len, "dropping batch refused by server: {err:#}");
                }
                Err(err) => {
                    self.failures = self.failures.saturating_add(1);
                    let delay = self
                        .base_delay
                        .saturating_mul(2u32.saturating_pow(self.failures - 1))
                        .min(MAX_RETRY_DELAY);
                    self.retry_at = Some(Instant::now() + delay);
                    return Err(err);
                }
            }

            self.buffer.drain(..len);
        }

        if rejected > 0 {
            bail!("server refused {rejected} points, they were dropped");
        }
        Ok(())
    }
}

/// Sink used when uploading is disabled.
#[derive(Debug, Default)]
pub struct DiscardSink;

impl PointSink for DiscardSink {
    async fn write(&mut self, point: Point) -> Result<()> {
        tracing::trace!(measurement = %point.measurement, "upload disabled, discarding point");
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(self) {}
}
