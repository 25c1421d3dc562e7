//! Fork an upload stream to a side consumer while it is being stored.
//!
//! The fork is a bounded channel: the reader will not pull the next chunk
//! from its source until the previous chunk has a slot, so the consumer
//! never falls more than one chunk behind and nothing is buffered twice.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::PollSender;
use tracing::trace;

pub struct TeeReader<R> {
    inner: R,
    /// `None` once the source ended or the consumer went away
    fork: Option<PollSender<Bytes>>,
}

impl<R> TeeReader<R> {
    pub fn new(inner: R, fork: mpsc::Sender<Bytes>) -> Self {
        Self {
            inner,
            fork: Some(PollSender::new(fork)),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TeeReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if buf.remaining() == 0 {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        if let Some(fork) = this.fork.as_mut() {
            match fork.poll_reserve(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(_)) => {
                    trace!("tee consumer closed, continuing without it");
                    this.fork = None;
                }
            }
        }

        let before = buf.filled().len();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
        match &polled {
            Poll::Ready(Ok(())) => {
                let chunk = &buf.filled()[before..];
                if chunk.is_empty() {
                    // EOF: dropping the sender ends the consumer's stream
                    this.fork = None;
                } else if let Some(fork) = this.fork.as_mut() {
                    if fork.send_item(Bytes::copy_from_slice(chunk)).is_err() {
                        this.fork = None;
                    }
                }
            }
            Poll::Ready(Err(_)) => this.fork = None,
            // keep the reserved slot for the next poll
            Poll::Pending => {}
        }
        polled
    }
}

/// Wrap `reader` so that its first `window` bytes are collected on a
/// separate task. The task drains the rest of the stream and resolves once
/// the returned reader hits EOF, fails, or is dropped.
pub fn tee_with_probe<R>(reader: R, window: usize) -> (TeeReader<R>, JoinHandle<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let (tx, mut rx) = mpsc::channel::<Bytes>(1);
    let probe = tokio::spawn(async move {
        let mut probe = Vec::with_capacity(window);
        while let Some(chunk) = rx.recv().await {
            if probe.len() < window {
                let take = (window - probe.len()).min(chunk.len());
                probe.extend_from_slice(&chunk[..take]);
            }
        }
        probe
    });
    (TeeReader::new(reader, tx), probe)
}
