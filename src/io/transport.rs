//! Datagram transport seam and its UDP implementation.

use std::io;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::{Result, SdkError};

/// Source and sink of whole datagrams for the ingestion loop.
///
/// Implementations must be cancel-safe: a `recv` or `send` future dropped
/// before completion must not lose or duplicate a datagram.
#[async_trait::async_trait]
pub trait DatagramTransport: Send + Sync + 'static {
    /// Receive one datagram into `buf`, returning its length.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send one datagram to the instrument.
    async fn send(&self, datagram: &[u8]) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait::async_trait]
impl DatagramTransport for Box<dyn DatagramTransport> {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).recv(buf).await
    }

    async fn send(&self, datagram: &[u8]) -> io::Result<usize> {
        (**self).send(datagram).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }
}

/// Wraps the UDP transport of each new session, e.g. to capture or shape
/// traffic. Runs on the I/O thread inside its runtime.
pub type TransportLayer = Arc<dyn Fn(UdpTransport) -> Box<dyn DatagramTransport> + Send + Sync>;

/// UDP socket bound to the local adapter, sending to the instrument.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    remote: SocketAddr,
}

impl UdpTransport {
    /// Bind the local endpoint without a runtime.
    ///
    /// Binding happens on the caller's thread so address errors surface from
    /// `connect` directly; the socket is registered with a runtime later by
    /// [`UdpTransport::from_std`].
    pub fn bind(local: SocketAddr, recv_buf_size: usize) -> Result<StdUdpSocket> {
        let socket = StdUdpSocket::bind(local).map_err(|e| SdkError::socket("bind", e))?;
        socket.set_broadcast(true).map_err(|e| SdkError::socket("set_broadcast", e))?;
        socket.set_nonblocking(true).map_err(|e| SdkError::socket("set_nonblocking", e))?;

        if recv_buf_size > 0 {
            match set_recv_buffer_size(&socket, recv_buf_size) {
                Ok(()) => debug!(local = %local, recv_buf_size, "Receive buffer size set"),
                Err(e) => warn!(
                    local = %local,
                    recv_buf_size,
                    error = %e,
                    "Could not set receive buffer size"
                ),
            }
        }
        Ok(socket)
    }

    /// Register a bound socket with the current tokio runtime.
    pub fn from_std(socket: StdUdpSocket, remote: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::from_std(socket).map_err(|e| SdkError::socket("register", e))?;
        Ok(Self { socket, remote })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}

#[async_trait::async_trait]
impl DatagramTransport for UdpTransport {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        // Replies may come from any port on the instrument
        let (len, _from) = self.socket.recv_from(buf).await?;
        Ok(len)
    }

    async fn send(&self, datagram: &[u8]) -> io::Result<usize> {
        self.socket.send_to(datagram, self.remote).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(unix)]
fn set_recv_buffer_size(socket: &StdUdpSocket, size: usize) -> io::Result<()> {
    rustix::net::sockopt::set_socket_recv_buffer_size(socket, size)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_recv_buffer_size(_socket: &StdUdpSocket, _size: usize) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "SO_RCVBUF is only set on unix targets"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_send_and_recv() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), 1 << 20).unwrap();
        let b = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let b_addr = b.local_addr().unwrap();
        let a = UdpTransport::from_std(a, b_addr).unwrap();

        a.send(&[1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 16];
        let (len, from) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[1, 2, 3]);

        b.send_to(&[4, 5], from).unwrap();
        let len = a.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[4, 5]);
    }

    #[test]
    fn bind_error_is_a_socket_error() {
        // TEST-NET-1 is never assigned to a local interface
        let err = UdpTransport::bind("192.0.2.1:0".parse().unwrap(), 0).unwrap_err();
        assert!(matches!(err, SdkError::Socket { .. }));
    }
}
