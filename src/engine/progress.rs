//! Progress stream subscriber.
//!
//! Opens the server-push progress channel, decodes `data: {"progress": n}`
//! frames incrementally, and forwards raw values to the reconciler. The
//! subscription self-terminates exactly once when a terminal value (>= 100)
//! arrives, and is closeable from outside at any point without leaking the
//! reader task.

use crate::error::ClientError;
use futures::{Future, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Shared count of open stream channels. The invariant is at most one open
/// channel per active run; every open increments and every close decrements
/// exactly once, whichever side initiates the close.
#[derive(Clone, Default)]
pub struct StreamGauge(Arc<AtomicUsize>);

impl StreamGauge {
    pub fn open_count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn inc(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn dec(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Messages the subscriber sends to the reconciler.
#[derive(Debug)]
pub enum StreamSignal {
    /// Raw value from the wire; clamping happens in `ProcessingRun`.
    Progress(i64),
    /// Transport failure. The channel is already closed; no reconnect.
    Error(ClientError),
    /// The channel reached its terminal value or the server closed it.
    Closed,
}

/// Owned handle for one open stream channel.
pub struct Subscription {
    handle: tokio::task::JoinHandle<()>,
    closed: Arc<AtomicBool>,
    gauge: StreamGauge,
}

impl Subscription {
    /// Close the channel. Idempotent; a no-op when the reader already
    /// self-terminated.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.gauge.dec();
            self.handle.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Open the progress channel and pump decoded values into `tx`.
pub fn subscribe(
    http: reqwest::Client,
    url: reqwest::Url,
    idle_timeout: Duration,
    gauge: StreamGauge,
    tx: mpsc::UnboundedSender<StreamSignal>,
) -> Subscription {
    let tx2 = tx.clone();
    attach(gauge, tx, pump(http, url, idle_timeout, tx2))
}

/// Wire a reader future into an owned, gauge-counted subscription.
fn attach<F>(gauge: StreamGauge, tx: mpsc::UnboundedSender<StreamSignal>, reader: F) -> Subscription
where
    F: Future<Output = Result<(), ClientError>> + Send + 'static,
{
    gauge.inc();
    let closed = Arc::new(AtomicBool::new(false));
    let closed2 = closed.clone();
    let gauge2 = gauge.clone();

    let handle = tokio::spawn(async move {
        let outcome = reader.await;
        if !closed2.swap(true, Ordering::SeqCst) {
            gauge2.dec();
        }
        match outcome {
            Ok(()) => {
                let _ = tx.send(StreamSignal::Closed);
            }
            Err(e) => {
                let _ = tx.send(StreamSignal::Error(e));
            }
        }
    });

    Subscription {
        handle,
        closed,
        gauge,
    }
}

async fn pump(
    http: reqwest::Client,
    url: reqwest::Url,
    idle_timeout: Duration,
    tx: mpsc::UnboundedSender<StreamSignal>,
) -> Result<(), ClientError> {
    let resp = http
        .get(url)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
        .map_err(|e| ClientError::StreamError(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(ClientError::StreamError(format!("HTTP {}", resp.status())));
    }

    let mut stream = resp.bytes_stream();
    let mut decoder = SseDecoder::default();

    loop {
        let next = tokio::time::timeout(idle_timeout, stream.next())
            .await
            .map_err(|_| {
                ClientError::StreamError(format!(
                    "no progress message within {}",
                    humantime::format_duration(idle_timeout)
                ))
            })?;
        let Some(chunk) = next else {
            // Server closed the channel without a terminal value.
            return Ok(());
        };
        let chunk = chunk.map_err(|e| ClientError::StreamError(e.to_string()))?;

        for raw in decoder.feed(&chunk) {
            let terminal = raw >= 100;
            let _ = tx.send(StreamSignal::Progress(raw));
            if terminal {
                return Ok(());
            }
        }
    }
}

/// Incremental decoder for the `data:` lines of the progress stream.
///
/// Tolerates chunk boundaries anywhere, `event:`/comment lines, and junk
/// payloads (skipped rather than treated as errors).
#[derive(Default)]
pub struct SseDecoder {
    buf: String,
}

/// Upper bound on bytes buffered while waiting for a newline. No real frame
/// comes close; anything past this is a garbage stream.
const MAX_BUFFERED_LINE: usize = 64 * 1024;

impl SseDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<i64> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();
        while let Some(nl) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=nl).collect();
            if let Some(v) = parse_data_line(line.trim_end_matches(['\r', '\n'])) {
                out.push(v);
            }
        }
        if self.buf.len() > MAX_BUFFERED_LINE {
            self.buf.clear();
        }
        out
    }
}

fn parse_data_line(line: &str) -> Option<i64> {
    let payload = line.strip_prefix("data:")?.trim();
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    value.get("progress")?.as_i64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_handles_split_frames() {
        let mut dec = SseDecoder::default();
        assert!(dec.feed(b"data: {\"prog").is_empty());
        assert_eq!(dec.feed(b"ress\": 42}\n\n"), vec![42]);
    }

    #[test]
    fn decoder_handles_multiple_frames_per_chunk() {
        let mut dec = SseDecoder::default();
        let got = dec.feed(b"data: {\"progress\": 10}\n\ndata: {\"progress\": 55}\n\n");
        assert_eq!(got, vec![10, 55]);
    }

    #[test]
    fn decoder_skips_non_data_lines_and_junk() {
        let mut dec = SseDecoder::default();
        let got = dec.feed(
            b": keep-alive\r\nevent: progress\r\ndata: not-json\r\ndata: {\"progress\": 99}\r\n\r\n",
        );
        assert_eq!(got, vec![99]);
    }

    #[test]
    fn decoder_passes_out_of_range_values_through() {
        // Clamping is the reconciler's job; the decoder stays faithful to the wire.
        let mut dec = SseDecoder::default();
        assert_eq!(dec.feed(b"data: {\"progress\": 400}\n"), vec![400]);
        assert_eq!(dec.feed(b"data: {\"progress\": -3}\n"), vec![-3]);
    }

    #[test]
    fn decoder_bounds_buffered_junk_without_newlines() {
        let mut dec = SseDecoder::default();
        let junk = vec![b'x'; 48 * 1024];
        for _ in 0..4 {
            assert!(dec.feed(&junk).is_empty());
        }
        assert!(dec.buf.len() <= MAX_BUFFERED_LINE);
        // Still decodes once real frames resume.
        assert_eq!(dec.feed(b"data: {\"progress\": 50}\n"), vec![50]);
    }

    #[tokio::test]
    async fn gauge_counts_open_and_close_exactly_once() {
        let gauge = StreamGauge::default();
        let (tx, _rx) = mpsc::unbounded_channel();

        let sub = attach(gauge.clone(), tx, futures::future::pending());
        assert_eq!(gauge.open_count(), 1);

        sub.close();
        assert_eq!(gauge.open_count(), 0);
        // A second close must not underflow the gauge.
        sub.close();
        assert_eq!(gauge.open_count(), 0);
    }

    #[tokio::test]
    async fn self_terminating_reader_releases_the_gauge() {
        let gauge = StreamGauge::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let sub = attach(gauge.clone(), tx, async { Ok(()) });
        assert!(matches!(rx.recv().await, Some(StreamSignal::Closed)));
        assert_eq!(gauge.open_count(), 0);

        // External close after self-termination is a no-op.
        sub.close();
        assert_eq!(gauge.open_count(), 0);
    }

    #[tokio::test]
    async fn failed_reader_reports_error_and_releases_the_gauge() {
        let gauge = StreamGauge::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _sub = attach(gauge.clone(), tx, async {
            Err(ClientError::StreamError("connection reset".into()))
        });
        assert!(matches!(rx.recv().await, Some(StreamSignal::Error(_))));
        assert_eq!(gauge.open_count(), 0);
    }

    #[tokio::test]
    async fn replacing_a_subscription_never_leaves_two_channels_open() {
        let gauge = StreamGauge::default();
        let (tx, _rx) = mpsc::unbounded_channel();

        let first = attach(gauge.clone(), tx.clone(), futures::future::pending());
        assert_eq!(gauge.open_count(), 1);

        // Single-slot ownership: close the prior channel before opening a new one.
        first.close();
        let _second = attach(gauge.clone(), tx, futures::future::pending());
        assert_eq!(gauge.open_count(), 1);
    }

    #[tokio::test]
    async fn dropping_a_subscription_closes_the_channel() {
        let gauge = StreamGauge::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        {
            let _sub = attach(gauge.clone(), tx, futures::future::pending());
            assert_eq!(gauge.open_count(), 1);
        }
        assert_eq!(gauge.open_count(), 0);
    }
}
