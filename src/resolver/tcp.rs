//! TCP fallback transport, used when a UDP response comes back truncated.
//!
//! DNS-over-TCP messages are prefixed with a 2-byte big-endian length, per
//! RFC 1035 §4.2.2; `continueSending`'s "flush remaining bytes, then swap
//! write→read interest" from the original is the `write_all`/`read`
//! sequence below.

use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// A per-query TCP fallback connection.
#[derive(Debug)]
pub struct TcpQuerySocket {
    stream: TcpStream,
}

impl TcpQuerySocket {
    pub async fn connect(nameserver: SocketAddr) -> crate::Result<Self> {
        let stream = TcpStream::connect(nameserver).await.map_err(crate::Error::new_resolve)?;
        Ok(TcpQuerySocket { stream })
    }

    /// Sends the length-prefixed query, looping until every byte is
    /// written (the original's "partial send" bookkeeping is subsumed by
    /// `write_all`, which is cancel-safe to simply retry from the top on
    /// the next reactor tick since nothing has been consumed from the
    /// source buffer on error).
    pub async fn send(&mut self, query: &[u8]) -> crate::Result<()> {
        let len = u16::try_from(query.len()).map_err(|_| crate::Error::new_resolve_timeout())?;
        self.stream.write_all(&len.to_be_bytes()).await.map_err(crate::Error::new_resolve)?;
        self.stream.write_all(query).await.map_err(crate::Error::new_resolve)?;
        Ok(())
    }

    /// Reads one complete length-prefixed response message.
    pub async fn recv(&mut self) -> crate::Result<Vec<u8>> {
        let mut len_buf = [0u8; 2];
        self.stream
            .read_exact(&mut len_buf)
            .await
            .map_err(crate::Error::new_resolve)?;
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).await.map_err(crate::Error::new_resolve)?;
        Ok(buf)
    }
}
