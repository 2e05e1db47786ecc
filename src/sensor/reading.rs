use std::fmt;

use anyhow::{Context as _, Result, bail};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::humidity::absolute_humidity;
use crate::sensor::DeviceNames;

/// Temperature and relative humidity both this close to zero mean the device
/// failed to read its sensor.
pub const ZERO_TOLERANCE: f64 = 1e-5;

/// Pressure at or below this is a placeholder from a device without a
/// barometer.
pub const PRESSURE_PLAUSIBILITY_HPA: f64 = 250.0;

const PRESSURE_DISPLAY_HPA: f64 = 500.0;

/// Reply body of the `hello` request.
#[derive(Debug, Deserialize)]
struct HelloReply {
    #[serde(rename = "ID", default)]
    id: u8,

    #[serde(rename = "T", default)]
    temperature_celsius: f64,

    #[serde(rename = "rH", default)]
    relative_humidity_pct: f64,

    #[serde(rename = "p", default)]
    pressure_hpa: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,

    pub device_id: u8,

    pub device_name: String,

    pub temperature_celsius: f64,

    pub relative_humidity_pct: f64,

    /// g/m³
    pub absolute_humidity: f64,

    /// 0 when the device does not report pressure.
    pub pressure_hpa: f64,
}

impl Reading {
    /// Decodes a `hello` reply and enriches it into a reading.
    ///
    /// Fails on malformed JSON and on the all-zero "could not read sensor"
    /// sentinel.
    pub fn parse(payload: &[u8], names: &DeviceNames, received_at: DateTime<Utc>) -> Result<Self> {
        let reply: HelloReply =
            serde_json::from_slice(payload).context("failed to decode device reply")?;

        if is_close(reply.temperature_celsius, 0.0, ZERO_TOLERANCE)
            && is_close(reply.relative_humidity_pct, 0.0, ZERO_TOLERANCE)
        {
            bail!(
                "device {} reported zero temperature and relative humidity",
                reply.id
            );
        }

        Ok(Self {
            timestamp: received_at,
            device_id: reply.id,
            device_name: names.resolve(reply.id).to_string(),
            temperature_celsius: reply.temperature_celsius,
            relative_humidity_pct: reply.relative_humidity_pct,
            absolute_humidity: absolute_humidity(
                reply.relative_humidity_pct,
                reply.temperature_celsius,
            ),
            pressure_hpa: reply.pressure_hpa,
        })
    }

    pub fn has_pressure(&self) -> bool {
        self.pressure_hpa > PRESSURE_PLAUSIBILITY_HPA
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {:<14} {:.2}°C, {:.2}% rH, {:.2} g/kg aH",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.device_name,
            self.temperature_celsius,
            self.relative_humidity_pct,
            self.absolute_humidity,
        )?;
        if self.pressure_hpa > PRESSURE_DISPLAY_HPA {
            write!(f, ", {:.2} hPa", self.pressure_hpa)?;
        }
        Ok(())
    }
}

fn is_close(have: f64, want: f64, tolerance: f64) -> bool {
    (have - want).abs() <= tolerance
}
