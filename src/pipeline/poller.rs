use std::ops::ControlFlow;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{RawFrame, ShutdownAck, forward};
use crate::sensor::DeviceRegistry;
use crate::udp::{self, HELLO_REQUEST};

/// Owns the live device table and queries whichever devices are due.
#[derive(Debug)]
pub struct Poller {
    registry: DeviceRegistry,
    poll_interval: Duration,
    query_timeout: Duration,
}

impl Poller {
    pub fn new(registry: DeviceRegistry, poll_interval: Duration, query_timeout: Duration) -> Self {
        Self {
            registry,
            poll_interval,
            query_timeout,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Queries every due device once, in registry order, and forwards each
    /// reply as soon as it arrives.
    ///
    /// Failed devices are skipped and stay due for the next pass. No new
    /// query starts once `cancel` fires.
    pub async fn poll_due(
        &mut self,
        frames: &mpsc::Sender<RawFrame>,
        cancel: &CancellationToken,
    ) -> ControlFlow<()> {
        for device in self.registry.iter_mut() {
            if cancel.is_cancelled() {
                return ControlFlow::Break(());
            }
            if !device.is_due(Utc::now(), self.poll_interval) {
                continue;
            }

            tracing::debug!(device = %device.name, address = %device.address, "querying device");
            let payload = match udp::query(&device.address, HELLO_REQUEST, self.query_timeout).await
            {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(device = %device.name, "query failed: {err:#}");
                    continue;
                }
            };

            device.last_contact = Some(Utc::now());
            tracing::debug!(device = %device.name, bytes = payload.len(), "forwarding reply");
            forward(frames, payload, cancel).await?;
        }

        ControlFlow::Continue(())
    }
}

pub async fn run_poller(
    mut poller: Poller,
    check_interval: Duration,
    frames: mpsc::Sender<RawFrame>,
    cancel: CancellationToken,
    ack: ShutdownAck,
) {
    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                tracing::trace!("checking devices");
                if poller.poll_due(&frames, &cancel).await.is_break() {
                    break;
                }
            }
        }
    }

    ack.acknowledge();
}
