use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::influx::{Point, PointSink};
use crate::pipeline::ShutdownAck;
use crate::sensor::Reading;

/// One point per reading, measured under the device name and tagged with its
/// id. Pressure is only included when it is plausible.
pub fn to_point(reading: &Reading) -> Point {
    let point = Point::new(reading.device_name.as_str(), reading.timestamp)
        .tag("id", reading.device_id.to_string())
        .field("T", reading.temperature_celsius)
        .field("rH", reading.relative_humidity_pct)
        .field("aH", reading.absolute_humidity);

    if reading.has_pressure() {
        point.field("p", reading.pressure_hpa)
    } else {
        point
    }
}

pub async fn run_uploader<S: PointSink>(
    mut sink: S,
    mut readings: mpsc::Receiver<Reading>,
    cancel: CancellationToken,
    ack: ShutdownAck,
) {
    loop {
        let reading = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            reading = readings.recv() => match reading {
                Some(reading) => reading,
                None => break,
            },
        };

        tracing::debug!(device = %reading.device_name, "queueing reading for upload");
        if let Err(err) = sink.write(to_point(&reading)).await {
            tracing::error!(device = %reading.device_name, "failed to queue point: {err:#}");
        }
    }

    if let Err(err) = sink.flush().await {
        tracing::warn!("final flush failed: {err:#}");
    }
    sink.close().await;
    ack.acknowledge();
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn reading(pressure_hpa: f64) -> Reading {
        Reading {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
            device_id: 7,
            device_name: "garage".to_string(),
            temperature_celsius: 14.5,
            relative_humidity_pct: 61.0,
            absolute_humidity: 7.61,
            pressure_hpa,
        }
    }

    #[test]
    fn point_carries_identity_and_humidity() {
        let point = to_point(&reading(1009.0));
        assert_eq!(point.measurement, "garage");
        assert_eq!(point.tags, vec![("id".to_string(), "7".to_string())]);
        assert_eq!(point.timestamp, reading(0.0).timestamp);
        assert_eq!(point.field_value("T"), Some(14.5));
        assert_eq!(point.field_value("rH"), Some(61.0));
        assert_eq!(point.field_value("aH"), Some(7.61));
        assert_eq!(point.field_value("p"), Some(1009.0));
    }

    #[test]
    fn pressure_only_above_threshold() {
        assert_eq!(to_point(&reading(0.0)).field_value("p"), None);
        assert_eq!(to_point(&reading(250.0)).field_value("p"), None);
        assert_eq!(to_point(&reading(250.5)).field_value("p"), Some(250.5));
        assert!(!to_point(&reading(0.0)).to_line_protocol().unwrap().contains("p="));
    }
}
