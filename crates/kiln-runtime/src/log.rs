//! Line-oriented writer over a caller-owned build log sink.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

/// Writes build output to a caller-owned sink.
///
/// The sink is best-effort: the first write failure is logged and every
/// later line is dropped, so a broken sink never fails the build.
pub struct LineSink<'a, W: ?Sized> {
    inner: &'a mut W,
    broken: bool,
}

impl<'a, W> LineSink<'a, W>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    pub fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            broken: false,
        }
    }

    pub async fn write_line(&mut self, line: &str) {
        if self.broken {
            return;
        }
        let result = async {
            self.inner.write_all(line.as_bytes()).await?;
            self.inner.write_all(b"\n").await?;
            self.inner.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!(error = %e, "build log sink failed, discarding further output");
            self.broken = true;
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    struct FailingWriter {
        attempts: usize,
    }

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.attempts += 1;
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn writes_lines_with_newlines() {
        let mut buf: Vec<u8> = Vec::new();
        let mut sink = LineSink::new(&mut buf);
        sink.write_line("Step 1/2").await;
        sink.write_line("Step 2/2").await;
        assert!(!sink.is_broken());
        assert_eq!(String::from_utf8(buf).unwrap(), "Step 1/2\nStep 2/2\n");
    }

    #[tokio::test]
    async fn broken_sink_is_tried_once() {
        let mut writer = FailingWriter { attempts: 0 };
        {
            let mut sink = LineSink::new(&mut writer);
            sink.write_line("one").await;
            sink.write_line("two").await;
            assert!(sink.is_broken());
        }
        assert_eq!(writer.attempts, 1);
    }
}
