use crate::errors::QuotaExceeded;
use pin_project::pin_project;
use std::{
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, ReadBuf};

/// Byte-budget-limited reader
///
/// Reads are truncated so that no more than the budget is ever delivered.
/// Once the budget reaches zero, the bytes from that read are still
/// returned and every following read fails with [QuotaExceeded]. A source
/// that ends before the budget runs out reaches EOF normally.
///
/// The count of delivered bytes is shared, so it can still be read after the
/// reader itself has been handed to a consumer.
#[pin_project]
#[derive(Debug)]
pub struct QuotaedReader<R> {
    #[pin]
    inner: R,
    remaining: u64,
    delivered: Arc<AtomicU64>,
}

impl<R> QuotaedReader<R> {
    pub fn new(inner: R, quota: u64) -> Self {
        QuotaedReader {
            inner,
            remaining: quota,
            delivered: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Handle on the number of bytes delivered so far
    pub fn delivered(&self) -> Arc<AtomicU64> {
        self.delivered.clone()
    }

    /// Bytes left in the budget
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead> AsyncRead for QuotaedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if *this.remaining == 0 {
            return Poll::Ready(Err(QuotaExceeded.into()));
        }
        let limit = usize::try_from(*this.remaining)
            .unwrap_or(usize::MAX)
            .min(buf.remaining());
        let mut limited = buf.take(limit);
        match this.inner.poll_read(cx, &mut limited) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {
                let n = limited.filled().len();
                // take() gives a fresh view, so the outer buffer has to be told
                // about both the initialized and the filled bytes.
                unsafe {
                    buf.assume_init(n);
                }
                buf.advance(n);
                *this.remaining -= n as u64;
                this.delivered.fetch_add(n as u64, Ordering::Relaxed);
                Poll::Ready(Ok(()))
            }
        }
    }
}
