//! InfluxDB line protocol points.
//!
//! ```text
//! measurement,tag=value field=1.5,other=2 1709295005000
//! ```

use chrono::{DateTime, Utc};

/// Timestamp precision used for every written line.
pub const WRITE_PRECISION: &str = "ms";

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,

    pub tags: Vec<(String, String)>,

    pub fields: Vec<(String, f64)>,

    pub timestamp: DateTime<Utc>,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: f64) -> Self {
        self.fields.push((key.into(), value));
        self
    }

    pub fn field_value(&self, key: &str) -> Option<f64> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
    }

    /// Renders the point as one line, tags sorted by key, timestamp in
    /// milliseconds. NaN and infinite fields are left out; `None` when no
    /// field remains.
    pub fn to_line_protocol(&self) -> Option<String> {
        let fields: Vec<_> = self.fields.iter().filter(|(_, v)| v.is_finite()).collect();
        if fields.is_empty() {
            return None;
        }

        let mut line = escape_measurement(&self.measurement);

        let mut tags: Vec<_> = self.tags.iter().collect();
        tags.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, value) in tags {
            line.push(',');
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&escape_key(value));
        }

        line.push(' ');
        for (i, (key, value)) in fields.into_iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&value.to_string());
        }

        line.push(' ');
        line.push_str(&self.timestamp.timestamp_millis().to_string());
        Some(line)
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Tag keys, tag values and field keys share the same escaping rules.
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
