use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::RwLock;

use crate::error::Result;

/// Symmetric RTP socket. The source slot is learned from inbound
/// datagrams; the destination slot is published from SDP. Writes before
/// the destination is known report full-length success without touching
/// the wire, so encoders are never stalled by the post-answer race.
#[derive(Debug)]
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    src: RwLock<Option<SocketAddr>>,
    dst: RwLock<Option<SocketAddr>>,
}

impl UdpChannel {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            src: RwLock::new(None),
            dst: RwLock::new(None),
        }
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    pub async fn src(&self) -> Option<SocketAddr> {
        *self.src.read().await
    }

    pub async fn set_dst(&self, addr: SocketAddr) {
        if addr.port() == 0 || addr.ip().is_unspecified() {
            return;
        }
        let mut dst = self.dst.write().await;
        match *dst {
            None => tracing::info!(%addr, "setting media destination"),
            Some(prev) if prev != addr => tracing::info!(%addr, "changing media destination"),
            _ => {}
        }
        *dst = Some(addr);
    }

    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let (n, addr) = self.socket.recv_from(buf).await?;
        let mut src = self.src.write().await;
        match *src {
            None => tracing::info!(%addr, "setting media source"),
            Some(prev) if prev != addr => tracing::info!(%addr, "changing media source"),
            _ => {}
        }
        *src = Some(addr);
        Ok(n)
    }

    pub async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let dst = *self.dst.read().await;
        match dst {
            None => Ok(buf.len()),
            Some(addr) => self.socket.send_to(buf, addr).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn loopback_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn write_without_destination_stays_local() {
        let channel = UdpChannel::new(loopback_socket().await);
        let n = channel.send(&[1, 2, 3]).await.unwrap();
        assert_eq!(n, 3);
    }

    #[tokio::test]
    async fn learns_source_and_sends_to_destination() {
        let channel = UdpChannel::new(loopback_socket().await);
        let peer = loopback_socket().await;
        let channel_addr: SocketAddr =
            format!("127.0.0.1:{}", channel.local_port().unwrap()).parse().unwrap();

        channel.set_dst(peer.local_addr().unwrap()).await;
        channel.send(&[7; 4]).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = tokio::time::timeout(Duration::from_secs(1), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(from, channel_addr);

        assert!(channel.src().await.is_none());
        peer.send_to(&[1], channel_addr).await.unwrap();
        channel.recv(&mut buf).await.unwrap();
        assert_eq!(channel.src().await, Some(peer.local_addr().unwrap()));
    }

    #[tokio::test]
    async fn invalid_destination_is_ignored() {
        let channel = UdpChannel::new(loopback_socket().await);
        channel.set_dst("0.0.0.0:0".parse().unwrap()).await;
        // Still no destination: the write is silently dropped.
        assert_eq!(channel.send(&[0; 8]).await.unwrap(), 8);
    }
}
