//! Stream tap: a minimal subscriber for watching live frames

use std::net::SocketAddr;

use tokio::net::UdpSocket;

use crate::stream::StreamError;

/// Largest frame a UDP datagram can carry
const MAX_DATAGRAM_BYTES: usize = 65_535;

/// UDP client that subscribes to a grid's stream port
pub struct TapClient {
    socket: UdpSocket,
    server: SocketAddr,
}

impl TapClient {
    /// Bind an ephemeral local socket matching the server's address family
    pub async fn connect(server: SocketAddr) -> Result<Self, StreamError> {
        let local = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| StreamError::Bind {
                addr: local.to_string(),
                source,
            })?;
        Ok(Self { socket, server })
    }

    /// Use an already bound socket
    pub fn from_socket(socket: UdpSocket, server: SocketAddr) -> Self {
        Self { socket, server }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn subscribe(&self) -> Result<(), StreamError> {
        self.socket.send_to(b"SUBSCRIBE", self.server).await?;
        Ok(())
    }

    pub async fn unsubscribe(&self) -> Result<(), StreamError> {
        self.socket.send_to(b"UNSUBSCRIBE", self.server).await?;
        Ok(())
    }

    /// Wait for the next frame from the server
    ///
    /// Datagrams from any other address are skipped.
    pub async fn next_frame(&self) -> Result<String, StreamError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            if from != self.server {
                tracing::debug!(%from, "Ignoring datagram from unexpected sender");
                continue;
            }
            return Ok(String::from_utf8_lossy(&buf[..len]).into_owned());
        }
    }
}
