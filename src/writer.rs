//! Dedicated writer task for request frames.
//!
//! Callers never touch the socket write half. Encoded requests go through an
//! mpsc channel to a single writer task, so frames hit the wire in submission
//! order and bursts are batched into one `writev` call.
//!
//! # Architecture
//!
//! ```text
//! Caller 1 ─┐
//! Caller 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Socket
//! Caller N ─┘
//! ```
//!
//! Backpressure is a semaphore with `max_pending_frames` permits. A caller
//! takes one permit per frame; the writer hands them back once the batch
//! holding those frames is on the wire.

use std::io::IoSlice;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{IprotoError, Result};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A fully framed request (length prefix included).
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub bytes: Bytes,
}

impl OutboundFrame {
    #[inline]
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task. Cheap to clone.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    /// One permit per frame that may still be queued.
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl WriterHandle {
    fn new(tx: mpsc::Sender<OutboundFrame>, permits: Arc<Semaphore>, timeout: Duration) -> Self {
        Self {
            tx,
            permits,
            timeout,
        }
    }

    /// Queue a frame, waiting while backpressure is active.
    ///
    /// Fails with [`IprotoError::Backpressure`] if no queue slot frees up in
    /// time and with [`IprotoError::ConnectionLost`] once the writer is gone.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        let permit = match tokio::time::timeout(self.timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(IprotoError::ConnectionLost),
            Err(_) => return Err(IprotoError::Backpressure),
        };

        // A failed send drops the permit, which returns it.
        self.tx
            .send(frame)
            .await
            .map_err(|_| IprotoError::ConnectionLost)?;
        // The writer task releases it after the write.
        permit.forget();
        Ok(())
    }
}

/// Spawn the writer task over the write half of a connection.
///
/// The task ends cleanly when every [`WriterHandle`] is dropped and with an
/// error on the first failed write.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let permits = Arc::new(Semaphore::new(config.max_pending_frames.max(1)));

    let handle = WriterHandle::new(tx, permits.clone(), config.backpressure_timeout);

    let task = tokio::spawn(async move {
        let result = writer_loop(rx, writer, &permits).await;
        // Wake senders still waiting for a slot.
        permits.close();
        result
    });

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    permits: &Semaphore,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(first) = rx.recv().await else {
            // All handles dropped.
            let _ = writer.shutdown().await;
            return Ok(());
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        write_batch(&mut writer, &batch).await?;

        permits.add_permits(batch_size);
    }
}

/// Write a batch of frames using scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let slices: Vec<IoSlice<'_>> = batch.iter().map(|f| IoSlice::new(&f.bytes)).collect();
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();

    let written = writer.write_vectored(&slices).await?;

    if written == total_size {
        writer.flush().await?;
        return Ok(());
    }

    if written == 0 {
        return Err(write_zero());
    }

    // Partial write: continue from where the kernel stopped.
    let mut total_written = written;

    while total_written < total_size {
        let remaining_slices = build_remaining_slices(batch, total_written);
        if remaining_slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&remaining_slices).await?;
        if written == 0 {
            return Err(write_zero());
        }

        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

fn write_zero() -> IprotoError {
    IprotoError::Io(std::io::Error::new(
        std::io::ErrorKind::WriteZero,
        "write_vectored returned 0",
    ))
}

/// IoSlices for the bytes of `batch` after the first `skip_bytes`.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for frame in batch {
        let end = offset + frame.size();
        if skip_bytes < end {
            let start_in_frame = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame.bytes[start_in_frame..]));
        }
        offset = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn frame(body: &'static [u8]) -> OutboundFrame {
        OutboundFrame::new(Bytes::from_static(body))
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, DEFAULT_MAX_PENDING_FRAMES);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_writer_handle_send() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        handle.send(frame(b"hello")).await.unwrap();

        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_frames_keep_submission_order() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        for i in 0..10u32 {
            let bytes = Bytes::copy_from_slice(&i.to_be_bytes());
            handle.send(OutboundFrame::new(bytes)).await.unwrap();
        }

        let mut buf = vec![0u8; 40];
        server.read_exact(&mut buf).await.unwrap();

        let received: Vec<u32> = buf
            .chunks(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(received, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_send_waits_out_backpressure() {
        let (tx, mut rx) = mpsc::channel::<OutboundFrame>(10);
        let permits = Arc::new(Semaphore::new(0));
        let handle = WriterHandle::new(tx, permits.clone(), Duration::from_secs(1));

        let drain = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            permits.add_permits(1);
            rx.recv().await
        });

        handle.send(frame(b"x")).await.unwrap();
        assert!(drain.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_backpressure_timeout() {
        let (tx, _rx) = mpsc::channel::<OutboundFrame>(10);
        let permits = Arc::new(Semaphore::new(0));
        let handle = WriterHandle::new(tx, permits.clone(), Duration::from_millis(10));

        let result = handle.send(frame(b"x")).await;
        assert!(matches!(result, Err(IprotoError::Backpressure)));
        assert!(!result.unwrap_err().is_connection_error());
        assert_eq!(permits.available_permits(), 0);
    }

    #[tokio::test]
    async fn test_send_after_writer_gone() {
        let (tx, rx) = mpsc::channel::<OutboundFrame>(10);
        drop(rx);
        let permits = Arc::new(Semaphore::new(10));
        let handle = WriterHandle::new(tx, permits.clone(), Duration::from_secs(1));

        let result = handle.send(frame(b"x")).await;
        assert!(matches!(result, Err(IprotoError::ConnectionLost)));
        assert_eq!(permits.available_permits(), 10);
    }

    #[tokio::test]
    async fn test_closed_queue_fails_waiting_sender() {
        let (tx, _rx) = mpsc::channel::<OutboundFrame>(10);
        let permits = Arc::new(Semaphore::new(0));
        let handle = WriterHandle::new(tx, permits.clone(), Duration::from_secs(5));

        let waiter = tokio::spawn(async move { handle.send(frame(b"x")).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        permits.close();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(IprotoError::ConnectionLost)));
    }

    #[tokio::test]
    async fn test_written_frames_free_their_slots() {
        let (client, mut server) = duplex(4096);
        let config = WriterConfig {
            max_pending_frames: 2,
            backpressure_timeout: Duration::from_millis(500),
            ..WriterConfig::default()
        };
        let (handle, _task) = spawn_writer_task(client, config);

        // More frames than slots: each send needs an earlier write to finish.
        for _ in 0..6 {
            handle.send(frame(b"ab")).await.unwrap();
        }

        let mut buf = [0u8; 12];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abababababab");
    }

    #[test]
    fn test_build_remaining_slices() {
        let batch = vec![frame(b"hello"), frame(b"world")];

        assert_eq!(build_remaining_slices(&batch, 0).len(), 2);

        let slices = build_remaining_slices(&batch, 3);
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b"lo");

        let slices = build_remaining_slices(&batch, 7);
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"rld");
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|_| frame(b"abc")).collect();

        write_batch(&mut buf, &batch).await.unwrap();

        assert_eq!(buf.into_inner(), b"abcabcabcabcabc".to_vec());
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }
}
