//! Poller -> parser -> CSV logger -> uploader, connected by single-slot
//! hand-off channels and stopped through one cancellation token.

mod csv_log;
mod parser;
mod poller;
mod uploader;

use std::fmt;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::influx::PointSink;
use crate::sensor::{DeviceRegistry, Reading};

pub use csv_log::*;
pub use parser::*;
pub use poller::*;
pub use uploader::*;

/// Reply bytes exactly as received from a device.
pub type RawFrame = Vec<u8>;

const HANDOFF_CAPACITY: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Poller,
    Parser,
    CsvLogger,
    Uploader,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Poller => "poller",
            Stage::Parser => "parser",
            Stage::CsvLogger => "csv-logger",
            Stage::Uploader => "uploader",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage's one-time "stopped" signal. Consumed by [`ShutdownAck::acknowledge`].
#[derive(Debug)]
pub struct ShutdownAck {
    stage: Stage,
    tx: oneshot::Sender<Stage>,
}

impl ShutdownAck {
    pub fn new(stage: Stage) -> (Self, oneshot::Receiver<Stage>) {
        let (tx, rx) = oneshot::channel();
        (Self { stage, tx }, rx)
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn acknowledge(self) {
        tracing::debug!(stage = %self.stage, "stage stopped");
        let _ = self.tx.send(self.stage);
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub data_dir: PathBuf,

    pub poll_interval: Duration,

    pub check_interval: Duration,

    pub query_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config, data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            poll_interval: config.poll_interval(),
            check_interval: config.check_interval(),
            query_timeout: config.query_timeout(),
        }
    }
}

/// Handle to the running stages.
#[derive(Debug)]
pub struct Pipeline {
    cancel: CancellationToken,
    acks: Vec<(Stage, oneshot::Receiver<Stage>)>,
}

impl Pipeline {
    pub fn spawn<S: PointSink>(settings: PipelineSettings, registry: DeviceRegistry, sink: S) -> Self {
        let cancel = CancellationToken::new();
        let names = registry.names();

        let (frame_tx, frame_rx) = mpsc::channel::<RawFrame>(HANDOFF_CAPACITY);
        let (parsed_tx, parsed_rx) = mpsc::channel::<Reading>(HANDOFF_CAPACITY);
        let (logged_tx, logged_rx) = mpsc::channel::<Reading>(HANDOFF_CAPACITY);

        let mut acks = Vec::with_capacity(4);
        let mut ack_for = |stage| {
            let (ack, rx) = ShutdownAck::new(stage);
            acks.push((stage, rx));
            ack
        };

        let poller = Poller::new(registry, settings.poll_interval, settings.query_timeout);
        tokio::spawn(run_poller(
            poller,
            settings.check_interval,
            frame_tx,
            cancel.clone(),
            ack_for(Stage::Poller),
        ));
        tokio::spawn(run_parser(
            names,
            frame_rx,
            parsed_tx,
            cancel.clone(),
            ack_for(Stage::Parser),
        ));
        tokio::spawn(run_csv_logger(
            DailyCsvLog::new(settings.data_dir),
            parsed_rx,
            logged_tx,
            cancel.clone(),
            ack_for(Stage::CsvLogger),
        ));
        tokio::spawn(run_uploader(
            sink,
            logged_rx,
            cancel.clone(),
            ack_for(Stage::Uploader),
        ));

        Self { cancel, acks }
    }

    /// Cancels every stage and waits up to `grace` for all acknowledgments.
    ///
    /// The error names the stages that did not acknowledge.
    pub async fn shutdown(self, grace: Duration) -> Result<()> {
        self.cancel.cancel();
        let deadline = Instant::now() + grace;

        let mut stuck = Vec::new();
        for (stage, rx) in self.acks {
            match timeout_at(deadline, rx).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) => {
                    tracing::error!(%stage, "stage exited without acknowledging shutdown");
                    stuck.push(stage.as_str());
                }
                Err(_) => {
                    tracing::error!(%stage, ?grace, "stage did not acknowledge shutdown in time");
                    stuck.push(stage.as_str());
                }
            }
        }

        if !stuck.is_empty() {
            bail!("pipeline stages failed to stop: {}", stuck.join(", "));
        }

        tracing::info!("pipeline stopped");
        Ok(())
    }
}

/// Hands `item` downstream unless cancellation wins first. Breaks when the
/// pipeline is stopping or the receiver is gone.
async fn forward<T>(tx: &mpsc::Sender<T>, item: T, cancel: &CancellationToken) -> ControlFlow<()> {
    tokio::select! {
        biased;
        sent = tx.send(item) => {
            if sent.is_err() {
                tracing::debug!("downstream stage stopped");
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        }
        _ = cancel.cancelled() => ControlFlow::Break(()),
    }
}
