use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use sensor_datalogger::config::InfluxConfig;
use sensor_datalogger::influx::{InfluxClient, InfluxWriter, Point, PointSink, WriteOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, sleep};

#[derive(Debug, Clone)]
struct Request {
    head: String,
    body: String,
}

/// Measurement name the fake server refuses with 400, like a line it cannot
/// parse.
const MALFORMED: &str = "malformed";

/// Minimal HTTP/1.1 endpoint that records each request and answers with the
/// current status code and an empty body.
#[derive(Debug, Clone)]
struct FakeInflux {
    url: String,
    status: Arc<AtomicU16>,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl FakeInflux {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Self {
            url: format!("http://{}", listener.local_addr().unwrap()),
            status: Arc::new(AtomicU16::new(204)),
            requests: Arc::default(),
        };

        let handle = server.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle.clone().serve(stream));
            }
        });

        server
    }

    async fn serve(self, mut stream: TcpStream) {
        while let Some(request) = read_request(&mut stream).await {
            let status = if request.body.contains(MALFORMED) {
                "400 Bad Request"
            } else {
                match self.status.load(Ordering::SeqCst) {
                    204 => "204 No Content",
                    429 => "429 Too Many Requests",
                    _ => "500 Internal Server Error",
                }
            };
            self.requests.lock().unwrap().push(request);
            let response = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\n\r\n");
            if stream.write_all(response.as_bytes()).await.is_err() {
                break;
            }
        }
    }

    fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    fn config(&self) -> InfluxConfig {
        InfluxConfig {
            enabled: true,
            url: format!("{}/", self.url),
            token: "secret".to_string(),
            org: "home".to_string(),
            bucket: "sensors".to_string(),
            batch_size: 20,
            flush_interval_ms: 60_000,
            retry_buffer_limit: 100,
        }
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<Request> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let body_start = head_end + 4;
    while buf.len() < body_start + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let body = String::from_utf8_lossy(&buf[body_start..body_start + content_length]).into_owned();
    Some(Request { head, body })
}

fn point(name: &str, minute: u32) -> Point {
    Point::new(name, Utc.with_ymd_and_hms(2024, 3, 9, 12, minute, 0).unwrap())
        .tag("id", "1")
        .field("T", 20.5)
}

async fn wait_for_requests(server: &FakeInflux, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.requests().len() < count {
        assert!(Instant::now() < deadline, "timed out waiting for {count} requests");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn flush_sends_pending_points_in_one_request() {
    let server = FakeInflux::start().await;
    let config = server.config();
    let client = InfluxClient::new(&config).unwrap();
    let mut writer = InfluxWriter::spawn(client, WriteOptions::from(&config));

    for minute in 0..3 {
        writer.write(point("kitchen", minute)).await.unwrap();
    }
    writer.flush().await.unwrap();
    writer.close().await;

    let requests = server.requests();
    assert_eq!(requests.len(), 1);

    let head = requests[0].head.to_lowercase();
    assert!(
        head.starts_with("post /api/v2/write?org=home&bucket=sensors&precision=ms "),
        "{head}"
    );
    assert!(head.contains("authorization: token secret"), "{head}");

    let lines: Vec<_> = requests[0].body.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "kitchen,id=1 T=20.5 1709985600000");
    assert!(lines[2].ends_with(" 1709985720000"));
}

#[tokio::test]
async fn full_batch_is_sent_without_explicit_flush() {
    let server = FakeInflux::start().await;
    let config = InfluxConfig {
        batch_size: 2,
        ..server.config()
    };
    let client = InfluxClient::new(&config).unwrap();
    let mut writer = InfluxWriter::spawn(client, WriteOptions::from(&config));

    writer.write(point("hall", 0)).await.unwrap();
    writer.write(point("hall", 1)).await.unwrap();
    wait_for_requests(&server, 1).await;

    assert_eq!(server.requests()[0].body.lines().count(), 2);
    writer.close().await;
}

#[tokio::test]
async fn flush_sends_in_batches_of_batch_size() {
    let server = FakeInflux::start().await;
    let config = InfluxConfig {
        batch_size: 2,
        flush_interval_ms: 60_000,
        ..server.config()
    };
    let client = InfluxClient::new(&config).unwrap();
    let mut writer = InfluxWriter::spawn(client, WriteOptions::from(&config));

    // Make the automatic batch-size flush fail so the points pile up.
    server.status.store(500, Ordering::SeqCst);
    for minute in 0..5 {
        writer.write(point("attic", minute)).await.unwrap();
    }
    wait_for_requests(&server, 1).await;

    server.status.store(204, Ordering::SeqCst);
    writer.flush().await.unwrap();
    writer.close().await;

    let sizes: Vec<_> = server
        .requests()
        .iter()
        .skip(1)
        .map(|r| r.body.lines().count())
        .collect();
    assert_eq!(sizes, [2, 2, 1]);
}

#[tokio::test]
async fn rejected_write_is_reported_and_retried_on_next_flush() {
    let server = FakeInflux::start().await;
    let config = server.config();
    let client = InfluxClient::new(&config).unwrap();
    let mut writer = InfluxWriter::spawn(client, WriteOptions::from(&config));

    server.status.store(500, Ordering::SeqCst);
    writer.write(point("garage", 0)).await.unwrap();
    let err = writer.flush().await.unwrap_err();
    assert!(format!("{err:#}").contains("rejected"), "{err:#}");

    server.status.store(204, Ordering::SeqCst);
    writer.flush().await.unwrap();
    writer.close().await;

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].body, requests[1].body);
}

#[tokio::test]
async fn refused_batch_is_dropped_and_later_points_go_through() {
    let server = FakeInflux::start().await;
    let config = InfluxConfig {
        batch_size: 1,
        ..server.config()
    };
    let client = InfluxClient::new(&config).unwrap();
    let mut writer = InfluxWriter::spawn(client, WriteOptions::from(&config));

    writer.write(point(MALFORMED, 0)).await.unwrap();
    for minute in 1..4 {
        writer.write(point("cellar", minute)).await.unwrap();
    }
    writer.flush().await.unwrap();
    writer.flush().await.unwrap();
    writer.close().await;

    let bodies: Vec<_> = server.requests().into_iter().map(|r| r.body).collect();
    assert_eq!(bodies.len(), 4, "{bodies:?}");
    assert!(bodies[0].starts_with(MALFORMED));
    for (body, minute) in bodies[1..].iter().zip(1i64..) {
        assert_eq!(
            *body,
            format!("cellar,id=1 T=20.5 {}", 1_709_985_600_000 + minute * 60_000)
        );
    }
}

#[tokio::test]
async fn explicit_flush_reports_refused_points() {
    let server = FakeInflux::start().await;
    let config = InfluxConfig {
        batch_size: 1,
        ..server.config()
    };
    let client = InfluxClient::new(&config).unwrap();
    let mut writer = InfluxWriter::spawn(client, WriteOptions::from(&config));

    // With the server down, the first point stays buffered behind backoff and
    // the refused one queues up behind it.
    server.status.store(500, Ordering::SeqCst);
    writer.write(point("cellar", 0)).await.unwrap();
    writer.write(point(MALFORMED, 1)).await.unwrap();
    wait_for_requests(&server, 1).await;

    server.status.store(204, Ordering::SeqCst);
    let err = writer.flush().await.unwrap_err();
    assert!(err.to_string().contains("refused 1 points"), "{err:#}");

    // Nothing is left to resend.
    writer.flush().await.unwrap();
    writer.close().await;
    assert_eq!(server.requests().len(), 3);
}

#[tokio::test]
async fn rate_limited_write_is_kept_for_retry() {
    let server = FakeInflux::start().await;
    let config = server.config();
    let client = InfluxClient::new(&config).unwrap();
    let mut writer = InfluxWriter::spawn(client, WriteOptions::from(&config));

    server.status.store(429, Ordering::SeqCst);
    writer.write(point("porch", 0)).await.unwrap();
    assert!(writer.flush().await.is_err());

    server.status.store(204, Ordering::SeqCst);
    writer.flush().await.unwrap();
    writer.close().await;

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].body, requests[1].body);
}

#[tokio::test]
async fn point_without_finite_fields_is_not_sent() {
    let server = FakeInflux::start().await;
    let config = server.config();
    let client = InfluxClient::new(&config).unwrap();
    let mut writer = InfluxWriter::spawn(client, WriteOptions::from(&config));

    let at = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
    writer
        .write(Point::new("attic", at).field("aH", f64::NAN))
        .await
        .unwrap();
    writer
        .write(Point::new("attic", at).field("T", 5.0).field("aH", f64::NAN))
        .await
        .unwrap();
    writer.flush().await.unwrap();
    writer.close().await;

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body, "attic T=5 1709985600000");
}

#[tokio::test]
async fn client_rejects_unreachable_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = InfluxConfig {
        url: format!("http://127.0.0.1:{closed_port}"),
        ..FakeInflux::start().await.config()
    };
    let client = InfluxClient::new(&config).unwrap();
    let err = client
        .write_lines(&["m f=1 1".to_string()])
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("failed to send write request"));
}
