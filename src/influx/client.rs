use std::time::Duration;

use anyhow::{Context as _, Result};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};

use crate::config::InfluxConfig;
use crate::influx::WRITE_PRECISION;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Thin InfluxDB v2 write API client.
#[derive(Debug, Clone)]
pub struct InfluxClient {
    http: reqwest::Client,
    write_url: String,
    token: String,
    org: String,
    bucket: String,
}

impl InfluxClient {
    pub fn new(config: &InfluxConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            write_url: format!("{}/api/v2/write", config.url.trim().trim_end_matches('/')),
            token: config.token.clone(),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
        })
    }

    pub async fn write_lines(&self, lines: &[String]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }

        self.http
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", WRITE_PRECISION),
            ])
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(lines.join("\n"))
            .send()
            .await
            .with_context(|| format!("failed to send write request to {}", self.write_url))?
            .error_for_status()
            .context("write request rejected")?;

        Ok(())
    }
}

/// Whether a `write_lines` error means the server refused the data itself.
///
/// 4xx other than 429 will fail again on resend; transport errors, 429 and
/// 5xx are worth retrying.
pub fn is_permanent_rejection(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<reqwest::Error>())
        .filter_map(reqwest::Error::status)
        .any(|status| status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS)
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn plain_errors_are_retryable() {
        assert!(!is_permanent_rejection(&anyhow!("connection reset")));
        assert!(!is_permanent_rejection(
            &anyhow!("timed out").context("failed to send write request")
        ));
    }
}
