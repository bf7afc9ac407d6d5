//! Response body plumbing: wire-byte counting and transparent decoding.

use async_compression::tokio::bufread::{BrotliDecoder, GzipDecoder, ZlibDecoder};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt, TryStreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncRead;
use tokio_util::io::{ReaderStream, StreamReader};

const DECODE_CHUNK: usize = 64 * 1024;

/// Stream wrapper that adds every chunk's length to a shared counter as it
/// passes through. Sits below the decoder, so it observes wire bytes.
pub(crate) struct CountingStream {
    inner: BoxStream<'static, std::io::Result<Bytes>>,
    counter: Arc<AtomicU64>,
}

impl CountingStream {
    pub(crate) fn new(
        inner: BoxStream<'static, std::io::Result<Bytes>>,
        counter: Arc<AtomicU64>,
    ) -> Self {
        CountingStream { inner, counter }
    }
}

impl Stream for CountingStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.counter.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                Poll::Ready(Some(Ok(bytes)))
            }
            other => other,
        }
    }
}

/// Wrap a raw response into a decoded byte stream, counting wire bytes
/// into `raw_counter` before decoding.
pub(crate) fn decoded_body(
    response: reqwest::Response,
    encoding: super::ContentEncoding,
    raw_counter: Arc<AtomicU64>,
) -> BoxStream<'static, std::io::Result<Bytes>> {
    let raw = response
        .bytes_stream()
        .map_err(std::io::Error::other)
        .boxed();
    let counted = CountingStream::new(raw, raw_counter);

    match encoding {
        super::ContentEncoding::Identity => counted.boxed(),
        super::ContentEncoding::Gzip => {
            reader_stream(GzipDecoder::new(StreamReader::new(counted)))
        }
        super::ContentEncoding::Brotli => {
            reader_stream(BrotliDecoder::new(StreamReader::new(counted)))
        }
        super::ContentEncoding::Deflate => {
            reader_stream(ZlibDecoder::new(StreamReader::new(counted)))
        }
    }
}

fn reader_stream(
    reader: impl AsyncRead + Send + 'static,
) -> BoxStream<'static, std::io::Result<Bytes>> {
    ReaderStream::with_capacity(reader, DECODE_CHUNK).boxed()
}
