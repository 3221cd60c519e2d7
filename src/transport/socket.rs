//! Async UDP socket wrapper for session packets.
//!
//! One [`DatagramSocket`] is owned by the receive loop of a UDP transport;
//! sessions multiplexed over it send through cheap [`PacketSender`] clones.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use super::packet::Packet;
use crate::core::constants::DATAGRAM_BUFFER_SIZE;
use crate::core::NetResult;

/// Async UDP socket wrapper with a reusable receive buffer.
#[derive(Debug)]
pub struct DatagramSocket {
    /// The underlying UDP socket.
    socket: Arc<UdpSocket>,
    /// Receive buffer.
    recv_buffer: Vec<u8>,
}

impl DatagramSocket {
    /// Create a socket bound to the given address.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            recv_buffer: vec![0u8; DATAGRAM_BUFFER_SIZE],
        })
    }

    /// Get the local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive one datagram and return it with the sender's address.
    pub async fn recv_from(&mut self) -> io::Result<(&[u8], SocketAddr)> {
        let (len, addr) = self.socket.recv_from(&mut self.recv_buffer).await?;
        Ok((&self.recv_buffer[..len], addr))
    }

    /// Handle for sending packets from other tasks.
    pub fn sender(&self) -> PacketSender {
        PacketSender {
            socket: Arc::clone(&self.socket),
        }
    }
}

/// Cloneable send half of a [`DatagramSocket`].
#[derive(Debug, Clone)]
pub struct PacketSender {
    socket: Arc<UdpSocket>,
}

impl PacketSender {
    /// Encode and send one packet.
    pub async fn send(&self, packet: &Packet, to: SocketAddr) -> NetResult<()> {
        self.socket.send_to(&packet.encode(), to).await?;
        Ok(())
    }

    /// Send one packet without waiting for socket readiness.
    ///
    /// Used for fire-and-forget acknowledgements from packet handlers.
    pub fn try_send(&self, packet: &Packet, to: SocketAddr) -> NetResult<()> {
        self.socket.try_send_to(&packet.encode(), to)?;
        Ok(())
    }

    /// Local address of the shared socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SessionId;

    #[tokio::test]
    async fn test_socket_bind() {
        let socket = DatagramSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = socket.local_addr().unwrap();
        assert!(addr.port() != 0);
    }

    #[tokio::test]
    async fn test_packet_send_recv() {
        let mut server = DatagramSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = DatagramSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let packet = Packet::data(SessionId::from("s1"), b"hello".to_vec());
        client.sender().send(&packet, server_addr).await.unwrap();

        let (received, from) = server.recv_from().await.unwrap();
        assert_eq!(Packet::decode(received).unwrap(), packet);
        assert_eq!(from, client.local_addr().unwrap());
    }
}
