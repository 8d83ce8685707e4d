use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::channel::UdpChannel;
use super::{RtpHeader, MTU_SIZE};
use crate::error::{Error, Result};
use crate::srtp::SrtpSession;
use crate::stats::PortStats;

/// One parsed inbound packet as seen by a read loop.
pub struct InboundPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
    /// Datagram size on the wire, before SRTP trimming.
    pub wire_len: usize,
}

/// Per-SSRC inbound stream handed out by `accept_stream`.
pub struct ReadStream {
    ssrc: u32,
    rx: mpsc::Receiver<InboundPacket>,
}

impl ReadStream {
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Next packet for this SSRC; `None` once the session is closed.
    pub async fn read(&mut self) -> Option<InboundPacket> {
        self.rx.recv().await
    }
}

/// Single outbound sink. Sequence numbers and timestamps are supplied by
/// the caller (see `seq`); SRTP protection is applied here when keyed.
#[derive(Clone)]
pub struct WriteStream {
    channel: Arc<UdpChannel>,
    srtp: Option<Arc<SrtpSession>>,
}

impl WriteStream {
    pub async fn write_rtp(&self, header: &RtpHeader, payload: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(super::MIN_HEADER_SIZE + payload.len() + 16);
        header.serialize(&mut buf);
        buf.extend_from_slice(payload);
        let mut packet = buf.to_vec();
        if let Some(srtp) = &self.srtp {
            srtp.protect(&mut packet)?;
        }
        self.channel.send(&packet).await?;
        Ok(())
    }
}

/// RTP (or SRTP, when keyed) session over a UDP channel. A demux task
/// routes datagrams to per-SSRC streams; new SSRCs surface through
/// `accept_stream`.
pub struct RtpSession {
    write: WriteStream,
    accept_rx: Mutex<mpsc::Receiver<(ReadStream, u32)>>,
    shutdown: CancellationToken,
}

impl RtpSession {
    pub fn new(
        channel: Arc<UdpChannel>,
        srtp: Option<SrtpSession>,
        stats: Arc<PortStats>,
    ) -> Arc<Self> {
        let srtp = srtp.map(Arc::new);
        let (accept_tx, accept_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let session = Arc::new(Self {
            write: WriteStream {
                channel: channel.clone(),
                srtp: srtp.clone(),
            },
            accept_rx: Mutex::new(accept_rx),
            shutdown: shutdown.clone(),
        });
        tokio::spawn(demux_loop(channel, srtp, stats, accept_tx, shutdown));
        session
    }

    /// Wait for a new inbound SSRC. Fails once the session is closed.
    pub async fn accept_stream(&self) -> Result<(ReadStream, u32)> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::AlreadyClosed)
    }

    pub fn open_write_stream(&self) -> WriteStream {
        self.write.clone()
    }

    /// Tear down the demux task; pending and future reads observe EOF.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for RtpSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn demux_loop(
    channel: Arc<UdpChannel>,
    srtp: Option<Arc<SrtpSession>>,
    stats: Arc<PortStats>,
    accept_tx: mpsc::Sender<(ReadStream, u32)>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MTU_SIZE + 1];
    let mut streams: HashMap<u32, mpsc::Sender<InboundPacket>> = HashMap::new();
    loop {
        let n = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = channel.recv(&mut buf) => match res {
                Ok(n) => n,
                Err(err) => {
                    tracing::warn!(error = %err, "media socket read failed");
                    break;
                }
            },
        };
        let datagram = &buf[..n];
        let decrypted;
        let packet: &[u8] = match &srtp {
            Some(ctx) => match ctx.unprotect(datagram) {
                Ok(plain) => {
                    decrypted = plain;
                    &decrypted
                }
                Err(err) => {
                    tracing::debug!(error = %err, "dropping SRTP packet");
                    stats.ignored_packets.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            },
            None => datagram,
        };
        let (header, payload) = match RtpHeader::parse(packet) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::debug!(error = %err, "dropping malformed RTP packet");
                stats.ignored_packets.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        let ssrc = header.ssrc;
        if !streams.contains_key(&ssrc) {
            let (tx, rx) = mpsc::channel(64);
            if accept_tx
                .try_send((ReadStream { ssrc, rx }, ssrc))
                .is_err()
            {
                tracing::warn!(ssrc, "dropping new RTP stream: accept queue full");
                stats.ignored_packets.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            streams.insert(ssrc, tx);
        }
        let pkt = InboundPacket {
            payload: Bytes::copy_from_slice(&packet[payload]),
            header,
            wire_len: n,
        };
        if streams[&ssrc].try_send(pkt).is_err() {
            // Reader lagging or gone; RTP is drop-oldest territory anyway.
            stats.ignored_packets.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use tokio::net::UdpSocket;

    use super::*;
    use crate::srtp::{CryptoConf, CryptoProfile, KEYING_LEN};

    async fn bound_channel() -> (Arc<UdpChannel>, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (Arc::new(UdpChannel::new(socket)), addr)
    }

    fn packet_bytes(ssrc: u32, seq: u16, payload: &[u8]) -> Vec<u8> {
        let header = RtpHeader {
            marker: false,
            payload_type: 0,
            sequence_number: seq,
            timestamp: 0,
            ssrc,
        };
        let mut buf = BytesMut::new();
        header.serialize(&mut buf);
        buf.extend_from_slice(payload);
        buf.to_vec()
    }

    #[tokio::test]
    async fn demuxes_ssrcs_into_streams() {
        let (channel, addr) = bound_channel().await;
        let session = RtpSession::new(channel, None, Arc::new(PortStats::default()));
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        peer.send_to(&packet_bytes(1, 10, b"a"), addr).await.unwrap();
        let (mut stream, ssrc) = tokio::time::timeout(Duration::from_secs(1), session.accept_stream())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ssrc, 1);
        let pkt = stream.read().await.unwrap();
        assert_eq!(pkt.header.sequence_number, 10);
        assert_eq!(&pkt.payload[..], b"a");

        // A second SSRC yields a second stream.
        peer.send_to(&packet_bytes(2, 1, b"b"), addr).await.unwrap();
        let (_stream2, ssrc2) = session.accept_stream().await.unwrap();
        assert_eq!(ssrc2, 2);
    }

    #[tokio::test]
    async fn close_fails_accept_and_ends_streams() {
        let (channel, addr) = bound_channel().await;
        let session = RtpSession::new(channel, None, Arc::new(PortStats::default()));
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(&packet_bytes(3, 1, b"x"), addr).await.unwrap();
        let (mut stream, _) = session.accept_stream().await.unwrap();
        stream.read().await.unwrap();

        session.close();
        assert!(matches!(
            session.accept_stream().await,
            Err(Error::AlreadyClosed)
        ));
        assert!(tokio::time::timeout(Duration::from_secs(1), stream.read())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn srtp_session_roundtrip() {
        let keying: Vec<u8> = (0..KEYING_LEN as u8).collect();
        let conf = CryptoConf {
            profile: CryptoProfile::AesCm128HmacSha1_80,
            local_key: keying.clone(),
            remote_key: keying,
        };

        let (channel_a, _) = bound_channel().await;
        let (channel_b, addr_b) = bound_channel().await;
        channel_a.set_dst(addr_b).await;
        let stats = Arc::new(PortStats::default());
        let session_a =
            RtpSession::new(channel_a, Some(SrtpSession::new(&conf).unwrap()), stats.clone());
        let session_b =
            RtpSession::new(channel_b, Some(SrtpSession::new(&conf).unwrap()), stats.clone());

        let header = RtpHeader {
            marker: false,
            payload_type: 8,
            sequence_number: 55,
            timestamp: 320,
            ssrc: 42,
        };
        session_a
            .open_write_stream()
            .write_rtp(&header, &[9u8; 160])
            .await
            .unwrap();

        let (mut stream, ssrc) = tokio::time::timeout(Duration::from_secs(1), session_b.accept_stream())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ssrc, 42);
        let pkt = stream.read().await.unwrap();
        assert_eq!(pkt.header, header);
        assert_eq!(&pkt.payload[..], &[9u8; 160]);
    }
}
