//! UDP transport for outgoing DNS queries.
//!
//! A fresh ephemeral socket per query (rather than one shared socket)
//! follows the convention `hickory-proto`'s own `UdpClientStream` notes:
//! "a new UDP socket for every request...to avoid potential cache
//! poisoning." Each socket is polled by the resolver as its own reactor
//! event source until it answers or times out.

use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// One ephemeral UDP socket dedicated to a single outstanding query.
#[derive(Debug)]
pub struct UdpQuerySocket {
    socket: UdpSocket,
    nameserver: SocketAddr,
}

impl UdpQuerySocket {
    pub async fn connect(nameserver: SocketAddr) -> crate::Result<Self> {
        let bind_addr: SocketAddr = if nameserver.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr).await.map_err(crate::Error::new_resolve)?;
        socket.connect(nameserver).await.map_err(crate::Error::new_resolve)?;
        Ok(UdpQuerySocket { socket, nameserver })
    }

    pub async fn send(&self, query: &[u8]) -> crate::Result<()> {
        self.socket.send(query).await.map_err(crate::Error::new_resolve)?;
        Ok(())
    }

    /// Reads one datagram. Returns the number of bytes written into `buf`.
    pub async fn recv(&self, buf: &mut [u8]) -> crate::Result<usize> {
        self.socket.recv(buf).await.map_err(crate::Error::new_resolve)
    }

    pub fn nameserver(&self) -> SocketAddr {
        self.nameserver
    }
}
