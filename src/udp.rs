use std::time::Duration;

use anyhow::{Context as _, Result, anyhow, bail};
use serde::Deserialize;
use tokio::net::{UdpSocket, lookup_host};
use tokio::time::timeout;

/// Request answered with `{"ID","T","rH","p"}`.
pub const HELLO_REQUEST: &[u8] = b"hello";

/// Request answered with `{"T","rH","aH","p"}`.
pub const PING_REQUEST: &[u8] = b"ping";

pub const PING_TIMEOUT: Duration = Duration::from_secs(3);

const MAX_REPLY_LEN: usize = 512;

/// Sends `request` to `address` over a fresh socket and returns the first
/// datagram received within `deadline`.
pub async fn query(address: &str, request: &[u8], deadline: Duration) -> Result<Vec<u8>> {
    let remote = lookup_host(address)
        .await
        .with_context(|| format!("failed to resolve {address}"))?
        .next()
        .ok_or_else(|| anyhow!("no address found for {address}"))?;
    let local = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };

    let socket = UdpSocket::bind(local)
        .await
        .context("failed to bind UDP socket")?;
    socket
        .connect(remote)
        .await
        .with_context(|| format!("failed to connect to {address}"))?;

    let sent = socket
        .send(request)
        .await
        .with_context(|| format!("failed to send request to {address}"))?;
    tracing::trace!(address, bytes = sent, "sent request");

    let mut buf = vec![0u8; MAX_REPLY_LEN];
    let received = timeout(deadline, socket.recv(&mut buf))
        .await
        .with_context(|| format!("no response from {address} within {deadline:?}"))?
        .with_context(|| format!("failed to receive reply from {address}"))?;
    if received == 0 {
        bail!("empty reply from {address}");
    }

    buf.truncate(received);
    Ok(buf)
}

/// Reply body of the `ping` request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PingReply {
    #[serde(rename = "T", default)]
    pub temperature_celsius: f64,

    #[serde(rename = "rH", default)]
    pub relative_humidity_pct: f64,

    #[serde(rename = "aH", default)]
    pub absolute_humidity: f64,

    #[serde(rename = "p", default)]
    pub pressure_hpa: f64,
}

pub async fn ping(address: &str) -> Result<PingReply> {
    let payload = query(address, PING_REQUEST, PING_TIMEOUT).await?;
    serde_json::from_slice(&payload).context("failed to decode ping reply")
}
