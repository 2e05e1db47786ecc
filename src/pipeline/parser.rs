use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{RawFrame, ShutdownAck, forward};
use crate::sensor::{DeviceNames, Reading};

/// Turns one raw frame into a reading stamped with the current UTC time, or
/// logs why it was dropped.
pub fn parse_frame(names: &DeviceNames, frame: &[u8]) -> Option<Reading> {
    match Reading::parse(frame, names, Utc::now()) {
        Ok(reading) => {
            tracing::info!("{reading}");
            Some(reading)
        }
        Err(err) => {
            tracing::warn!(
                payload = %String::from_utf8_lossy(frame),
                "dropping frame: {err:#}"
            );
            None
        }
    }
}

pub async fn run_parser(
    names: DeviceNames,
    mut frames: mpsc::Receiver<RawFrame>,
    readings: mpsc::Sender<Reading>,
    cancel: CancellationToken,
    ack: ShutdownAck,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let Some(reading) = parse_frame(&names, &frame) else {
            continue;
        };
        if forward(&readings, reading, &cancel).await.is_break() {
            break;
        }
    }

    ack.acknowledge();
}
