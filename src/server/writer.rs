//! The single writer every byte sent to a client goes through.
//!
//! A [`Response`](crate::Response) and an event stream share one [`SocketWriter`]
//! per connection and keep their unsent bytes in a [`PendingWrite`].

use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Write half of a connection.
///
/// Once closed (by an error or by [`force_close`](SocketWriter::force_close)),
/// every later write is dropped.
#[derive(Debug)]
pub(crate) struct SocketWriter<W> {
    inner: W,
    closed: bool,
}

impl<W: AsyncWrite + Unpin> SocketWriter<W> {
    #[inline]
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner,
            closed: false,
        }
    }

    #[inline(always)]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    #[cfg(test)]
    pub(crate) fn get_ref(&self) -> &W {
        &self.inner
    }

    #[inline(always)]
    pub(crate) fn force_close(&mut self) {
        self.closed = true;
    }

    #[inline]
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf).await
    }

    #[inline]
    async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }

    /// Sends the write-side shutdown (FIN or TLS `close_notify`).
    pub(crate) async fn shutdown(&mut self) {
        if let Err(err) = self.inner.shutdown().await {
            debug!(error = %err, "socket shutdown failed");
        }
        self.closed = true;
    }
}

/// Serialized bytes plus how far they have been written.
///
/// `cursor == None` means there is nothing to send.
#[derive(Debug, Default)]
pub(crate) struct PendingWrite {
    buffer: Vec<u8>,
    cursor: Option<usize>,
}

impl PendingWrite {
    #[inline]
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            cursor: None,
        }
    }

    /// Queues `bytes` behind whatever is still unsent.
    #[inline]
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        self.buffer.extend_from_slice(bytes);
        self.cursor.get_or_insert(0);
    }

    #[inline(always)]
    pub(crate) fn is_empty(&self) -> bool {
        self.cursor.is_none()
    }

    /// Bytes not yet handed to the socket.
    #[inline]
    pub(crate) fn unsent(&self) -> &[u8] {
        match self.cursor {
            Some(cursor) => &self.buffer[cursor..],
            None => &[],
        }
    }

    #[inline]
    pub(crate) fn clear(&mut self) {
        self.buffer.clear();
        self.cursor = None;
    }

    /// Makes one write attempt.
    ///
    /// Returns `true` when nothing is left to send: the buffer was fully written,
    /// was already empty, or the socket failed. A failed socket is force-closed
    /// and reported as done, so the caller never waits on a dead peer.
    /// `false` means a partial write; call again to resume at the exact offset.
    ///
    /// Cancel safe: dropping the future before it completes loses no bytes.
    pub(crate) async fn write_chunk<W>(&mut self, writer: &mut SocketWriter<W>) -> bool
    where
        W: AsyncWrite + Unpin,
    {
        let Some(cursor) = self.cursor else {
            return true;
        };

        if writer.is_closed() {
            self.clear();
            return true;
        }

        match writer.write(&self.buffer[cursor..]).await {
            Ok(0) => {
                debug!(unsent = self.buffer.len() - cursor, "socket accepted no bytes");
                writer.force_close();
                self.clear();
                true
            }
            Ok(n) if cursor + n < self.buffer.len() => {
                self.cursor = Some(cursor + n);
                false
            }
            Ok(_) => {
                self.clear();

                if let Err(err) = writer.flush().await {
                    debug!(error = %err, "socket flush failed");
                    writer.force_close();
                }
                true
            }
            Err(err) => {
                debug!(error = %err, unsent = self.buffer.len() - cursor, "socket write failed");
                writer.force_close();
                self.clear();
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{Broken, Trickle};

    #[tokio::test]
    async fn resumes_at_exact_offset() {
        let data: Vec<u8> = (0..=99).collect();

        for step in [1, 3, 7, 33, 99, 100, 1000] {
            let mut writer = SocketWriter::new(Trickle::new(step));
            let mut pending = PendingWrite::default();
            pending.push(&data);

            let mut attempts = 1;
            while !pending.write_chunk(&mut writer).await {
                assert_eq!(pending.unsent(), &data[writer.get_ref().written.len()..]);
                attempts += 1;
            }

            assert_eq!(writer.get_ref().written, data, "step {step}");
            assert_eq!(attempts, data.len().div_ceil(step), "step {step}");
            assert_eq!(writer.get_ref().calls, attempts);
            assert!(pending.is_empty());
            assert!(!writer.is_closed());
        }
    }

    #[tokio::test]
    async fn empty_buffer_is_done() {
        let mut writer = SocketWriter::new(Trickle::new(8));
        let mut pending = PendingWrite::with_capacity(16);

        pending.push(b"");
        assert!(pending.is_empty());
        assert!(pending.write_chunk(&mut writer).await);
        assert_eq!(writer.get_ref().calls, 0);
    }

    #[tokio::test]
    async fn push_while_draining() {
        let mut writer = SocketWriter::new(Trickle::new(4));
        let mut pending = PendingWrite::default();

        pending.push(b"first ");
        assert!(!pending.write_chunk(&mut writer).await);
        pending.push(b"second");

        while !pending.write_chunk(&mut writer).await {}
        assert_eq!(writer.get_ref().written, b"first second");
    }

    #[tokio::test]
    async fn error_reports_done_and_closes() {
        for zero in [false, true] {
            let mut writer = SocketWriter::new(Broken::new(zero));
            let mut pending = PendingWrite::default();

            pending.push(b"never delivered");
            assert!(pending.write_chunk(&mut writer).await);
            assert!(writer.is_closed());
            assert!(pending.is_empty());

            pending.push(b"dropped without a syscall");
            assert!(pending.write_chunk(&mut writer).await);
            assert_eq!(writer.get_ref().calls, 1);
        }
    }
}
