//! Read/write buffering shared by the client and content managers.
//!
//! Adapted from hyper's `proto/h1/io.rs`: a `BytesMut` read buffer plus a
//! size-tracked write buffer with high/low water marks for flow control.
//! hyper uses this per HTTP/1 connection to pace one request/response
//! body; here the same shape paces one proxy relay's bytes in each
//! direction (spec.md §4.6/§4.7's "deregister read when the write buffer
//! is over the high-water mark, re-register once drained below the
//! low-water mark").

use bytes::{Buf, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const DEFAULT_READ_BUF_SIZE: usize = 8 * 1024;
const DEFAULT_HIGH_WATER: usize = 64 * 1024;
const DEFAULT_LOW_WATER: usize = 16 * 1024;

/// A read buffer plus a flow-controlled write buffer around one duplex
/// stream (a client socket or an upstream socket).
pub struct Buffered<T> {
    io: T,
    read_buf: BytesMut,
    write_buf: BytesMut,
    high_water: usize,
    low_water: usize,
}

impl<T> std::fmt::Debug for Buffered<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffered")
            .field("read_buf_len", &self.read_buf.len())
            .field("write_buf_len", &self.write_buf.len())
            .field("high_water", &self.high_water)
            .field("low_water", &self.low_water)
            .finish()
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> Buffered<T> {
    pub fn new(io: T) -> Self {
        Buffered {
            io,
            read_buf: BytesMut::with_capacity(DEFAULT_READ_BUF_SIZE),
            write_buf: BytesMut::new(),
            high_water: DEFAULT_HIGH_WATER,
            low_water: DEFAULT_LOW_WATER,
        }
    }

    pub fn read_buf(&self) -> &[u8] {
        &self.read_buf
    }

    /// Drops `n` already-consumed bytes from the front of the read
    /// buffer, e.g. after a request head has been parsed out of it.
    pub fn consume_read(&mut self, n: usize) {
        self.read_buf.advance(n);
    }

    /// Reads more bytes from the socket into the read buffer. Returns the
    /// number of bytes read; `0` means the peer closed its write side.
    pub async fn poll_read_more(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; DEFAULT_READ_BUF_SIZE];
        let n = self.io.read(&mut chunk).await?;
        self.read_buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Queues bytes to be written. Returns `true` if the write buffer is
    /// now over the high-water mark and the caller should stop reading
    /// from the *other* direction of the relay until it drains.
    pub fn queue_write(&mut self, bytes: &[u8]) -> bool {
        self.write_buf.extend_from_slice(bytes);
        self.write_buf.len() >= self.high_water
    }

    /// True once the write buffer has drained back below the low-water
    /// mark, meaning reads from the other direction may resume.
    pub fn is_drained(&self) -> bool {
        self.write_buf.len() <= self.low_water
    }

    pub fn has_pending_write(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Flushes as much of the write buffer as the socket currently
    /// accepts without blocking.
    pub async fn poll_flush(&mut self) -> io::Result<()> {
        while !self.write_buf.is_empty() {
            let n = self.io.write(&self.write_buf).await?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write zero bytes"));
            }
            self.write_buf.advance(n);
        }
        self.io.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.io.shutdown().await
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.io
    }

    pub fn into_inner(self) -> T {
        self.io
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn queue_write_reports_high_water_crossing() {
        let (a, _b) = duplex(1024 * 1024);
        let mut buffered = Buffered::new(a);
        buffered.high_water = 8;
        assert!(!buffered.queue_write(b"1234"));
        assert!(buffered.queue_write(b"56789"));
    }

    #[tokio::test]
    async fn drains_below_low_water_after_flush() {
        let (a, mut b) = duplex(1024 * 1024);
        let mut buffered = Buffered::new(a);
        buffered.queue_write(b"hello");
        buffered.poll_flush().await.unwrap();
        assert!(buffered.is_drained());
        let mut out = [0u8; 5];
        tokio::io::AsyncReadExt::read_exact(&mut b, &mut out).await.unwrap();
        assert_eq!(&out, b"hello");
    }
}
