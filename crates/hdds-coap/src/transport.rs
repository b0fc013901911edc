// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Datagram transport used by the observe dispatcher, endpoint and client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::error::{CoapError, CoapResult};
use crate::message::Message;

// ---------------------------------------------------------------------------
// Transmit trait
// ---------------------------------------------------------------------------

/// Fire-and-forget datagram sender.
///
/// Delivery tasks call this from many tasks at once, so implementations must
/// not block; a failed send is reported to the caller and never retried here.
pub trait Transmit: Send + Sync + 'static {
    fn transmit(&self, addr: SocketAddr, msg: &Message) -> CoapResult<()>;
}

impl<T: Transmit + ?Sized> Transmit for Arc<T> {
    fn transmit(&self, addr: SocketAddr, msg: &Message) -> CoapResult<()> {
        (**self).transmit(addr, msg)
    }
}

// ---------------------------------------------------------------------------
// UDP transport
// ---------------------------------------------------------------------------

/// UDP transport over a shared tokio socket.
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind a UDP socket to `addr`.
    pub async fn bind(addr: SocketAddr) -> CoapResult<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn from_socket(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    pub fn local_addr(&self) -> CoapResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Transmit for UdpTransport {
    fn transmit(&self, addr: SocketAddr, msg: &Message) -> CoapResult<()> {
        let bytes = msg.encode()?;
        self.socket.try_send_to(&bytes, addr)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Receive helpers
// ---------------------------------------------------------------------------

/// Wait for the next datagram and decode it.
pub async fn receive(socket: &UdpSocket, buf: &mut [u8]) -> CoapResult<(Message, SocketAddr)> {
    let (n, from) = socket.recv_from(buf).await?;
    let msg = Message::decode(&buf[..n])?;
    Ok((msg, from))
}

/// Like [`receive`], failing with [`CoapError::Timeout`] after `timeout`.
pub async fn receive_timeout(
    socket: &UdpSocket,
    timeout: Duration,
    buf: &mut [u8],
) -> CoapResult<(Message, SocketAddr)> {
    tokio::time::timeout(timeout, receive(socket, buf))
        .await
        .map_err(|_| CoapError::Timeout(timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::code;

    #[tokio::test]
    async fn test_transmit_and_receive() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let msg = Message::confirmable(code::CONTENT)
            .with_message_id(42)
            .with_payload(b"on".to_vec());
        a.transmit(b.local_addr().unwrap(), &msg).unwrap();

        let mut buf = vec![0u8; 1152];
        let (received, from) = receive(b.socket(), &mut buf).await.unwrap();
        assert_eq!(received, msg);
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_receive_timeout() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut buf = vec![0u8; 64];

        let err = receive_timeout(a.socket(), Duration::from_millis(20), &mut buf)
            .await
            .unwrap_err();
        assert!(matches!(err, CoapError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_receive_malformed() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        a.socket()
            .send_to(&[0xC0, 0x01], b.local_addr().unwrap())
            .await
            .unwrap();

        let mut buf = vec![0u8; 64];
        let err = receive(b.socket(), &mut buf).await.unwrap_err();
        assert!(matches!(err, CoapError::Malformed(_)));
    }
}
