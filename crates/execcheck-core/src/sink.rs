//! Per-process output capture.
//!
//! An [`OutputSink`] is the destination a single process's stdout is
//! streamed into. The runtime backend appends from its own task; the runner
//! reads a snapshot once the process has exited.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;

/// Thread-safe, growable byte buffer owned by one process.
///
/// Cloning yields another handle to the same buffer, so the backend can keep
/// a writer handle while the runner keeps the reader handle.
#[derive(Debug, Clone, Default)]
pub struct OutputSink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl OutputSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking writer cannot leave the Vec half-updated, so a poisoned
    // lock still guards valid bytes.
    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append bytes in delivery order.
    pub fn append(&self, bytes: &[u8]) {
        self.lock().extend_from_slice(bytes);
    }

    /// Point-in-time copy of everything appended so far.
    pub fn contents(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Whether the current contents contain `marker` as a contiguous
    /// byte sequence. The empty marker is always contained.
    pub fn contains(&self, marker: &[u8]) -> bool {
        if marker.is_empty() {
            return true;
        }
        let buf = self.lock();
        buf.windows(marker.len()).any(|window| window == marker)
    }

    /// Number of bytes captured so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing has been captured yet.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Contents decoded as UTF-8, with invalid sequences replaced.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }
}

impl AsyncWrite for OutputSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.append(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn new_sink_is_empty() {
        let sink = OutputSink::new();
        assert!(sink.is_empty());
        assert_eq!(sink.len(), 0);
        assert!(sink.contents().is_empty());
    }

    #[test]
    fn append_preserves_order() {
        let sink = OutputSink::new();
        sink.append(b"hi ");
        sink.append(b"std");
        sink.append(b"out\n");
        assert_eq!(sink.contents(), b"hi stdout\n");
        assert_eq!(sink.to_string_lossy(), "hi stdout\n");
    }

    #[test]
    fn contains_spans_append_boundaries() {
        let sink = OutputSink::new();
        sink.append(b"hi s");
        sink.append(b"tdout");
        assert!(sink.contains(b"hi stdout"));
        assert!(!sink.contains(b"goodbye"));
    }

    #[test]
    fn empty_marker_always_contained() {
        let sink = OutputSink::new();
        assert!(sink.contains(b""));
    }

    #[test]
    fn marker_longer_than_contents_is_not_contained() {
        let sink = OutputSink::new();
        sink.append(b"hi");
        assert!(!sink.contains(b"hi stdout"));
    }

    #[test]
    fn clones_share_the_buffer() {
        let sink = OutputSink::new();
        let writer = sink.clone();
        writer.append(b"shared");
        assert_eq!(sink.contents(), b"shared");
    }

    #[test]
    fn snapshot_is_detached_from_later_appends() {
        let sink = OutputSink::new();
        sink.append(b"first");
        let snapshot = sink.contents();
        sink.append(b"second");
        assert_eq!(snapshot, b"first");
        assert_eq!(sink.len(), "firstsecond".len());
    }

    #[test]
    fn concurrent_appends_lose_nothing() {
        let sink = OutputSink::new();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let writer = sink.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        writer.append(b"x");
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(sink.len(), 8000);
    }

    #[tokio::test]
    async fn async_write_appends() {
        let mut sink = OutputSink::new();
        sink.write_all(b"hi stdout\n").await.unwrap();
        sink.flush().await.unwrap();
        assert!(sink.contains(b"hi stdout"));
    }

    #[tokio::test]
    async fn tokio_copy_into_sink() {
        let reader: &[u8] = b"streamed bytes";
        let sink = OutputSink::new();
        let mut writer = sink.clone();
        let mut reader = reader;
        let copied = tokio::io::copy(&mut reader, &mut writer).await.unwrap();
        assert_eq!(copied, 14);
        assert_eq!(sink.contents(), b"streamed bytes");
    }
}
