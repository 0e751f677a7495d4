//! Stream wrapper that logs upload progress of an artifact body.

use crate::utils::format_bytes;
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

const LOG_EVERY: Duration = Duration::from_secs(10);

pub struct ProgressStream<S> {
    inner: S,
    name: String,
    total: u64,
    sent: u64,
    started: Instant,
    last_log: Instant,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    pub fn new(inner: S, name: impl Into<String>, total: u64) -> Self {
        let now = Instant::now();
        Self {
            inner,
            name: name.into(),
            total,
            sent: 0,
            started: now,
            last_log: now,
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent
    }

    fn percent(&self) -> u64 {
        if self.total == 0 {
            100
        } else {
            self.sent.saturating_mul(100) / self.total
        }
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.sent += chunk.len() as u64;
                let now = Instant::now();
                if now.duration_since(self.last_log) >= LOG_EVERY {
                    self.last_log = now;
                    info!(
                        name = %self.name,
                        percent = self.percent(),
                        sent = %format_bytes(self.sent),
                        total = %format_bytes(self.total),
                        "Upload progress"
                    );
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(None) => {
                debug!(
                    name = %self.name,
                    sent = self.sent,
                    elapsed = ?self.started.elapsed(),
                    "Upload body fully streamed"
                );
                Poll::Ready(None)
            }
            other => other,
        }
    }
}
