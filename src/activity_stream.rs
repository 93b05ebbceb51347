//! Async stream adapter that remembers when bytes last arrived.
//!
//! The connection handler's read timeout is an inactivity limit: it is measured from the most
//! recent read that delivered data, not from when the handler started waiting for a frame.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

/// Wraps a transport and records the time of every read that delivered at least one byte.
pub(crate) struct ActivityStream<S> {
    inner: S,
    last_read: Instant,
}

impl<S> ActivityStream<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self {
            inner,
            last_read: Instant::now(),
        }
    }

    pub(crate) fn last_read(&self) -> Instant {
        self.last_read
    }

    /// Restarts the inactivity clock, e.g. when the handler starts waiting for the next frame.
    pub(crate) fn touch(&mut self) {
        self.last_read = Instant::now();
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ActivityStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            if buf.filled().len() > before {
                self.last_read = Instant::now();
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ActivityStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn reads_with_data_move_the_clock() {
        let (mut client, server) = duplex(64);
        let mut stream = ActivityStream::new(server);
        let opened = stream.last_read();

        tokio::time::sleep(Duration::from_secs(3)).await;
        client.write_all(b"MSH|").await.expect("write");
        let mut buf = [0u8; 8];
        let read = stream.read(&mut buf).await.expect("read");

        assert_eq!(read, 4);
        assert_eq!(stream.last_read() - opened, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn eof_does_not_count_as_activity() {
        let (client, server) = duplex(64);
        let mut stream = ActivityStream::new(server);
        let opened = stream.last_read();
        drop(client);

        tokio::time::sleep(Duration::from_secs(3)).await;
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.expect("read"), 0);
        assert_eq!(stream.last_read(), opened);

        stream.touch();
        assert_eq!(stream.last_read() - opened, Duration::from_secs(3));
    }
}
