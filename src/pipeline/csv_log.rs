use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use chrono::{NaiveDate, SecondsFormat};
use csv::{Terminator, Writer, WriterBuilder};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::pipeline::{ShutdownAck, forward};
use crate::sensor::Reading;

pub const CSV_HEADER: [&str; 7] = [
    "datetime",
    "id",
    "name",
    "temp_degC",
    "relHum_%",
    "absHum_gkg",
    "pres_hPa",
];

pub const CSV_DELIMITER: u8 = b';';

pub fn log_file_name(date: NaiveDate) -> String {
    format!("{}_sensordata.csv", date.format("%Y%m%d"))
}

pub fn csv_record(reading: &Reading) -> [String; 7] {
    [
        reading.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        reading.device_id.to_string(),
        reading.device_name.clone(),
        format!("{:.3}", reading.temperature_celsius),
        format!("{:.3}", reading.relative_humidity_pct),
        format!("{:.3}", reading.absolute_humidity),
        format!("{:.3}", reading.pressure_hpa),
    ]
}

#[derive(Debug)]
struct OpenLog {
    date: NaiveDate,
    path: PathBuf,
    writer: Writer<File>,
}

impl OpenLog {
    fn open(dir: &Path, date: NaiveDate) -> Result<Self> {
        let path = dir.join(log_file_name(date));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;
        let is_empty = file
            .metadata()
            .with_context(|| format!("failed to stat log file: {}", path.display()))?
            .len()
            == 0;

        let mut writer = WriterBuilder::new()
            .delimiter(CSV_DELIMITER)
            .has_headers(false)
            .terminator(Terminator::Any(b'\n'))
            .from_writer(file);

        if is_empty {
            writer
                .write_record(CSV_HEADER)
                .with_context(|| format!("failed to write header to {}", path.display()))?;
            writer
                .flush()
                .with_context(|| format!("failed to flush {}", path.display()))?;
        }
        tracing::info!(path = %path.display(), "opened log file");

        Ok(Self { date, path, writer })
    }

    fn append(&mut self, reading: &Reading) -> Result<()> {
        self.writer
            .write_record(csv_record(reading))
            .with_context(|| format!("failed to write row to {}", self.path.display()))?;
        self.writer
            .flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))?;
        Ok(())
    }

    fn close(mut self) {
        if let Err(err) = self.writer.flush() {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to flush log file on close");
        }
        tracing::debug!(path = %self.path.display(), "closed log file");
    }
}

/// Appends readings to one CSV file per UTC day in `dir`.
///
/// The file for a day is opened on the first reading of that day and the
/// header is only written into an empty file.
#[derive(Debug)]
pub struct DailyCsvLog {
    dir: PathBuf,
    current: Option<OpenLog>,
}

impl DailyCsvLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            current: None,
        }
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|log| log.path.as_path())
    }

    pub fn append(&mut self, reading: &Reading) -> Result<()> {
        let date = reading.timestamp.date_naive();

        let log = match self.current.take() {
            Some(log) if log.date == date => log,
            previous => {
                if let Some(previous) = previous {
                    previous.close();
                }
                OpenLog::open(&self.dir, date)?
            }
        };

        self.current.insert(log).append(reading)
    }

    pub fn close(&mut self) {
        if let Some(log) = self.current.take() {
            log.close();
        }
    }
}

pub async fn run_csv_logger(
    mut log: DailyCsvLog,
    mut readings_in: mpsc::Receiver<Reading>,
    readings_out: mpsc::Sender<Reading>,
    cancel: CancellationToken,
    ack: ShutdownAck,
) {
    loop {
        let reading = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            reading = readings_in.recv() => match reading {
                Some(reading) => reading,
                None => break,
            },
        };

        match log.append(&reading) {
            Ok(()) => tracing::trace!(device = %reading.device_name, "logged reading"),
            Err(err) => {
                tracing::error!(device = %reading.device_name, "failed to log reading: {err:#}")
            }
        }

        if forward(&readings_out, reading, &cancel).await.is_break() {
            break;
        }
    }

    log.close();
    ack.acknowledge();
}
