//! Reusable copy buffers
//!
//! Every splice direction borrows one fixed 32 KiB buffer for its whole
//! lifetime and returns it when the direction ends. The pool keeps a
//! bounded free list so idle memory stays flat under the tight limits of
//! mobile tunnel providers.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of one pooled copy buffer.
pub const COPY_BUF_SIZE: usize = 32 * 1024;

/// Bounded pool of fixed-size copy buffers.
pub struct BufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
    max_idle: usize,
}

impl BufferPool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_idle.min(16))),
            max_idle,
        }
    }

    /// Borrow a buffer. Allocates when the free list is empty.
    pub fn take(&self) -> PooledBuf<'_> {
        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; COPY_BUF_SIZE].into_boxed_slice());
        PooledBuf {
            pool: self,
            buf: Some(buf),
        }
    }

    /// Number of buffers currently sitting in the free list.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn put(&self, buf: Box<[u8]>) {
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(32)
    }
}

/// A borrowed buffer, returned to the pool on drop.
pub struct PooledBuf<'a> {
    pool: &'a BufferPool,
    buf: Option<Box<[u8]>>,
}

impl Deref for PooledBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_ref().expect("buffer taken")
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

/// Copy `reader` into `writer` through one pooled buffer until EOF or
/// error, then shut the writer down. Returns the number of bytes moved.
pub async fn copy_with_pool<R, W>(
    pool: &BufferPool,
    reader: &mut R,
    writer: &mut W,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    copy_inner(pool, reader, writer, None).await
}

/// Like [`copy_with_pool`], additionally crediting every chunk to a live
/// byte counter as it moves, so per-session statistics stay current while
/// the direction is still running.
pub async fn copy_with_pool_counted<R, W>(
    pool: &BufferPool,
    reader: &mut R,
    writer: &mut W,
    counter: &std::sync::atomic::AtomicU64,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    copy_inner(pool, reader, writer, Some(counter)).await
}

async fn copy_inner<R, W>(
    pool: &BufferPool,
    reader: &mut R,
    writer: &mut W,
    counter: Option<&std::sync::atomic::AtomicU64>,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = pool.take();
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
        if let Some(counter) = counter {
            counter.fetch_add(n as u64, std::sync::atomic::Ordering::Relaxed);
        }
    }
    writer.shutdown().await.ok();
    Ok(total)
}
