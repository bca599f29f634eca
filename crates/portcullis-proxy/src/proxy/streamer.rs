//! Relays upstream response bodies to the client.
//!
//! Bodies are copied through a fixed 32 KiB buffer into a pipe whose read end
//! becomes the client response body. With a flush interval configured, a
//! separate task flushes buffered output on its own schedule; writes and
//! flushes share one lock so a flush never lands inside a partial write.

use super::client::BoxError;
use super::errors::LogContext;
use super::headers::{
    strip_connection_listed, strip_hop_headers, PortcullisHeadersExt, VALUE_CLOSE,
    X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
use super::ClientBody;
use crate::session::Session;
use async_trait::async_trait;
use futures::{future, TryStreamExt};
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper::body::{Body, Bytes, Frame};
use hyper::header::{self, HeaderMap};
use hyper::http::response;
use hyper::StatusCode;
use std::io::{self, Cursor};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, error};

pub const BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    #[error("short write: read {read} bytes, wrote {written}")]
    ShortWrite { read: usize, written: usize },
}

/// Destination of a body copy. A write either takes the whole chunk or
/// reports how much it took.
#[async_trait]
pub trait ChunkSink: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<usize>;

    async fn finish(&mut self) -> io::Result<()>;
}

#[async_trait]
impl<W> ChunkSink for W
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<usize> {
        self.write_all(chunk).await?;
        Ok(chunk.len())
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

/// Whether a read error is the other side going away rather than a fault.
pub fn is_canceled(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    ) || err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<hyper::Error>())
        .is_some_and(hyper::Error::is_canceled)
}

/// Copy `src` into `dst` until end of stream.
///
/// Read errors are logged unless they are cancellations; a sink that takes
/// fewer bytes than were read aborts the copy.
pub async fn copy_buffer<R, W>(
    src: &mut R,
    dst: &mut W,
    buf: &mut [u8],
    ctx: &LogContext,
) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: ChunkSink + ?Sized,
{
    let mut written: u64 = 0;
    loop {
        let nr = match src.read(buf).await {
            Ok(0) => return Ok(written),
            Ok(n) => n,
            Err(e) => {
                if !is_canceled(&e) {
                    error!(
                        api_id = %ctx.api_id,
                        org_id = %ctx.org_id,
                        "http: proxy error during body copy: {}", e
                    );
                }
                return Err(CopyError::Read(e));
            }
        };

        let nw = dst.write_chunk(&buf[..nr]).await.map_err(CopyError::Write)?;
        written += nw as u64;
        if nw != nr {
            return Err(CopyError::ShortWrite {
                read: nr,
                written: nw,
            });
        }
    }
}

/// Writer whose buffered output is flushed at least every `latency`.
pub struct MaxLatencyWriter<W> {
    dst: Arc<Mutex<W>>,
}

impl<W> MaxLatencyWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(dst: W) -> Self {
        Self {
            dst: Arc::new(Mutex::new(dst)),
        }
    }

    pub fn start_flush_loop(&self, latency: Duration) -> FlushLoop {
        let dst = Arc::clone(&self.dst);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + latency, latency);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let mut dst = dst.lock().await;
                        if let Err(e) = dst.flush().await {
                            debug!("Periodic flush stopped: {}", e);
                            break;
                        }
                    }
                }
            }
        });
        FlushLoop {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }
}

#[async_trait]
impl<W> ChunkSink for MaxLatencyWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<usize> {
        let mut dst = self.dst.lock().await;
        dst.write_all(chunk).await?;
        Ok(chunk.len())
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.dst.lock().await.shutdown().await
    }
}

/// Handle to a running flush loop. The loop is signalled to stop exactly
/// once, by `stop` or on drop.
pub struct FlushLoop {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl FlushLoop {
    /// Stop the loop and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for FlushLoop {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Adapt an HTTP body into a byte reader.
pub fn body_reader<B>(body: B) -> impl AsyncRead + Send + Unpin + 'static
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError> + Send + 'static,
{
    let chunks = BodyStream::new(body)
        .try_filter_map(|frame| future::ready(Ok(frame.into_data().ok())))
        .map_err(io::Error::other);
    StreamReader::new(chunks)
}

/// Upstream response captured in full for a secondary consumer.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    body: Bytes,
}

impl CapturedResponse {
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// An independent read cursor over the captured body.
    pub fn reader(&self) -> Cursor<Bytes> {
        Cursor::new(self.body.clone())
    }
}

/// Buffer the whole body. On a failed read whatever arrived is kept.
pub async fn capture<R>(src: &mut R, ctx: &LogContext) -> Bytes
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buffer = Vec::new();
    let mut buf = vec![0u8; BUFFER_SIZE];
    if let Err(e) = copy_buffer(src, &mut buffer, &mut buf, ctx).await {
        debug!(api_id = %ctx.api_id, "Response capture ended early: {}", e);
    }
    Bytes::from(buffer)
}

impl CapturedResponse {
    pub(crate) fn new(parts: &response::Parts, body: Bytes) -> Self {
        let content_length = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        Self {
            status: parts.status,
            headers: parts.headers.clone(),
            content_length,
            body,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResponseStreamer {
    flush_interval: Option<Duration>,
    close_connections: bool,
}

impl ResponseStreamer {
    pub fn new(flush_interval: Option<Duration>, close_connections: bool) -> Self {
        Self {
            flush_interval,
            close_connections,
        }
    }

    /// Normalise upstream response headers before they reach the client.
    pub fn prepare_headers(&self, res: &mut response::Parts, session: Option<&Session>) {
        strip_connection_listed(&mut res.headers);
        strip_hop_headers(&mut res.headers);

        if self.close_connections {
            res.set_header(&header::CONNECTION, &VALUE_CLOSE);
        }

        if let Some(session) = session {
            res.set_header_value(&X_RATELIMIT_LIMIT, &session.quota_max.to_string());
            res.set_header_value(&X_RATELIMIT_REMAINING, &session.quota_remaining.to_string());
            res.set_header_value(&X_RATELIMIT_RESET, &session.quota_renews.to_string());
        }
    }

    /// Start copying `src` to the client and return the client-side body.
    ///
    /// The copy runs on its own task; dropping the returned body ends it.
    pub fn relay<R>(&self, mut src: R, ctx: LogContext) -> ClientBody
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (writer, reader) = tokio::io::duplex(BUFFER_SIZE);
        let dst = BufWriter::with_capacity(BUFFER_SIZE, writer);
        let flush_interval = self.flush_interval;

        tokio::spawn(async move {
            let mut buf = vec![0u8; BUFFER_SIZE];
            let result = match flush_interval {
                Some(latency) => {
                    let mut dst = MaxLatencyWriter::new(dst);
                    let flusher = dst.start_flush_loop(latency);
                    let copied = copy_buffer(&mut src, &mut dst, &mut buf, &ctx).await;
                    flusher.stop().await;
                    finish(copied, &mut dst).await
                }
                None => {
                    let mut dst = dst;
                    let copied = copy_buffer(&mut src, &mut dst, &mut buf, &ctx).await;
                    finish(copied, &mut dst).await
                }
            };
            report_copy(result, &ctx);
        });

        StreamBody::new(ReaderStream::with_capacity(reader, BUFFER_SIZE).map_ok(Frame::data)).boxed()
    }
}

async fn finish<W: ChunkSink>(copied: Result<u64, CopyError>, dst: &mut W) -> Result<u64, CopyError> {
    let closed = dst.finish().await;
    let copied = copied?;
    closed.map_err(CopyError::Write)?;
    Ok(copied)
}

fn report_copy(result: Result<u64, CopyError>, ctx: &LogContext) {
    match result {
        Ok(bytes) => debug!(api_id = %ctx.api_id, bytes, "Response body relayed"),
        // Logged where it happened.
        Err(CopyError::Read(_)) => {}
        Err(CopyError::Write(e)) if is_canceled(&e) => {
            debug!(api_id = %ctx.api_id, "Client went away during body copy");
        }
        Err(e) => error!(
            api_id = %ctx.api_id,
            org_id = %ctx.org_id,
            "http: proxy error during body copy: {}", e
        ),
    }
}
