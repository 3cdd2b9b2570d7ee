//! Fragment relay: forwards a lazy upstream sequence into a sink one
//! fragment at a time.
//!
//! The relay never holds more than the fragment it is currently handing to
//! the sink. Upstream exhaustion finishes the sink cleanly; an upstream
//! error aborts it. A sink that reports itself closed (the consumer went
//! away) stops the relay and drops the upstream.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use log::{debug, warn};
use std::fmt::Display;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// The downstream consumer is gone; no further fragments can be delivered.
#[derive(Debug, Error)]
#[error("fragment sink closed")]
pub struct SinkClosed;

#[async_trait]
pub trait FragmentSink: Send {
    async fn send(&mut self, fragment: Bytes) -> Result<(), SinkClosed>;

    /// Upstream ended normally.
    async fn finish(&mut self) {}

    /// Upstream failed after zero or more fragments were delivered.
    async fn abort(&mut self, cause: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEnd {
    Finished,
    UpstreamFailed(String),
    SinkClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    pub fragments: usize,
    pub bytes: usize,
    pub end: RelayEnd,
}

pub async fn relay<S, T, E, K>(upstream: S, sink: &mut K) -> RelayReport
where
    S: Stream<Item = Result<T, E>>,
    T: Into<Bytes>,
    E: Display,
    K: FragmentSink + ?Sized,
{
    futures_util::pin_mut!(upstream);
    let mut fragments = 0;
    let mut bytes = 0;

    while let Some(item) = upstream.next().await {
        match item {
            Ok(fragment) => {
                let fragment = fragment.into();
                if fragment.is_empty() {
                    continue;
                }
                let len = fragment.len();
                if sink.send(fragment).await.is_err() {
                    debug!("Relay sink closed after {} fragments", fragments);
                    return RelayReport {
                        fragments,
                        bytes,
                        end: RelayEnd::SinkClosed,
                    };
                }
                fragments += 1;
                bytes += len;
            }
            Err(e) => {
                let cause = e.to_string();
                warn!("Relay upstream failed after {} fragments: {}", fragments, cause);
                sink.abort(&cause).await;
                return RelayReport {
                    fragments,
                    bytes,
                    end: RelayEnd::UpstreamFailed(cause),
                };
            }
        }
    }

    sink.finish().await;
    RelayReport {
        fragments,
        bytes,
        end: RelayEnd::Finished,
    }
}

/// Feeds a chunked response body. Pair with a capacity-1 channel so at most
/// one fragment waits for the transport.
pub struct ChannelSink {
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Result<Bytes, io::Error>>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl FragmentSink for ChannelSink {
    async fn send(&mut self, fragment: Bytes) -> Result<(), SinkClosed> {
        self.tx.send(Ok(fragment)).await.map_err(|_| SinkClosed)
    }

    // An error item makes the body stream fail, which terminates the chunked
    // transfer without its final chunk.
    async fn abort(&mut self, cause: &str) {
        let _ = self.tx.send(Err(io::Error::other(cause.to_string()))).await;
    }
}

/// Writes fragments to an async writer as they arrive (e.g. stdout).
pub struct WriterSink<W> {
    writer: W,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FragmentSink for WriterSink<W> {
    async fn send(&mut self, fragment: Bytes) -> Result<(), SinkClosed> {
        self.writer
            .write_all(&fragment)
            .await
            .map_err(|_| SinkClosed)?;
        self.writer.flush().await.map_err(|_| SinkClosed)
    }

    async fn finish(&mut self) {
        let _ = self.writer.flush().await;
    }

    async fn abort(&mut self, _cause: &str) {
        let _ = self.writer.flush().await;
    }
}
