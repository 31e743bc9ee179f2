//! Bidirectional byte pumping between two duplex streams.
//!
//! [`ByteRelay`] copies A->B and B->A concurrently. Whichever direction ends
//! first decides the outcome; the other direction gets a short window to
//! drain, then both write halves are shut down and both streams dropped.
//! [`WsByteStream`] lets a WebSocket take part as a plain byte stream.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{future, stream::BoxStream, Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_tungstenite::{tungstenite, tungstenite::Message, WebSocketStream};
use tokio_util::io::{CopyToBytes, SinkWriter, StreamReader};
use tracing::{debug, trace};

use crate::telemetry::Traffic;

/// Size of the copy buffer used per direction
pub const BUFFER_SIZE: usize = 16 * 1024;

/// How long the surviving direction may keep flushing after the other ends
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Which side of the relay ended first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

/// Outcome of a finished relay
#[derive(Debug)]
pub struct RelayReport {
    /// Bytes copied from A to B
    pub a_to_b: u64,
    /// Bytes copied from B to A
    pub b_to_a: u64,
    /// Side whose read half ended first (or whose peer failed a write)
    pub closed_by: Side,
    /// Set when the first direction ended with an error rather than EOF
    pub error: Option<io::Error>,
}

/// Pairs two duplex byte streams and shuttles bytes until either closes
pub struct ByteRelay<A, B> {
    a: A,
    b: B,
    traffic: Option<Arc<Traffic>>,
    drain_timeout: Duration,
}

impl<A, B> ByteRelay<A, B>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    pub fn new(a: A, b: B) -> Self {
        Self {
            a,
            b,
            traffic: None,
            drain_timeout: DRAIN_TIMEOUT,
        }
    }

    /// Report A->B bytes as sent and B->A bytes as received on `traffic`
    pub fn observe(mut self, traffic: Arc<Traffic>) -> Self {
        self.traffic = Some(traffic);
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Relay until one direction terminates, then tear both streams down.
    ///
    /// This is the single teardown path: it returns exactly once, after both
    /// streams have been shut down.
    pub async fn run(self) -> RelayReport {
        let (mut a_read, mut a_write) = tokio::io::split(self.a);
        let (mut b_read, mut b_write) = tokio::io::split(self.b);
        let a_to_b = AtomicU64::new(0);
        let b_to_a = AtomicU64::new(0);
        let traffic = self.traffic.as_deref();

        let (closed_by, error) = {
            let upstream = pump(&mut a_read, &mut b_write, &a_to_b, |n| {
                if let Some(t) = traffic {
                    t.record_sent(n);
                }
            });
            let downstream = pump(&mut b_read, &mut a_write, &b_to_a, |n| {
                if let Some(t) = traffic {
                    t.record_received(n);
                }
            });
            tokio::pin!(upstream, downstream);

            let (closed_by, result) = tokio::select! {
                res = &mut upstream => (Side::A, res),
                res = &mut downstream => (Side::B, res),
            };

            if result.is_ok() {
                let remaining = async {
                    match closed_by {
                        Side::A => (&mut downstream).await,
                        Side::B => (&mut upstream).await,
                    }
                };
                match tokio::time::timeout(self.drain_timeout, remaining).await {
                    Ok(Ok(())) => trace!("Relay drained both directions"),
                    Ok(Err(e)) => debug!("Relay drain ended with error: {}", e),
                    Err(_) => trace!("Relay drain window elapsed"),
                }
            }

            (closed_by, result.err())
        };

        let _ = a_write.shutdown().await;
        let _ = b_write.shutdown().await;

        RelayReport {
            a_to_b: a_to_b.load(Ordering::Relaxed),
            b_to_a: b_to_a.load(Ordering::Relaxed),
            closed_by,
            error,
        }
    }
}

/// Copy `reader` into `writer` until EOF, flushing every chunk and shutting
/// the writer down at the end.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    copied: &AtomicU64,
    on_chunk: impl Fn(u64),
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        copied.fetch_add(n as u64, Ordering::Relaxed);
        on_chunk(n as u64);
    }
    writer.shutdown().await
}

type FrameSink = Pin<Box<dyn Sink<Bytes, Error = io::Error> + Send>>;

/// A WebSocket seen as a duplex byte stream.
///
/// Binary and text frames are read as raw bytes, a close frame reads as EOF,
/// writes go out as binary frames and shutdown sends a close frame. Frame
/// boundaries carry no meaning.
pub struct WsByteStream {
    reader: StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>,
    writer: SinkWriter<CopyToBytes<FrameSink>>,
}

impl WsByteStream {
    pub fn new<S>(ws: WebSocketStream<S>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (write, read) = ws.split();

        let frames = read
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Binary(data)) => Some(Ok(Bytes::from(data))),
                    Ok(Message::Text(text)) => Some(Ok(Bytes::from(text))),
                    Ok(_) => None,
                    Err(e) => Some(Err(io::Error::other(e))),
                })
            })
            .boxed();

        let sink: FrameSink = Box::pin(
            write
                .with(|data: Bytes| {
                    future::ready(Ok::<_, tungstenite::Error>(Message::Binary(data.to_vec())))
                })
                .sink_map_err(io::Error::other),
        );

        Self {
            reader: StreamReader::new(frames),
            writer: SinkWriter::new(CopyToBytes::new(sink)),
        }
    }
}

impl AsyncRead for WsByteStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for WsByteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}
