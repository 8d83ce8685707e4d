use std::sync::{Arc, Mutex};

use super::session::WriteStream;
use super::RtpHeader;
use crate::error::Result;

/// Vends outbound per-payload-type streams sharing one SSRC. Sequence
/// numbers and timestamps are tracked per stream; coordination between
/// streams (DTMF events aligning to audio time) happens through
/// `current_timestamp`.
pub struct SeqWriter {
    out: WriteStream,
    ssrc: u32,
}

impl SeqWriter {
    pub fn new(out: WriteStream) -> Self {
        Self {
            out,
            ssrc: rand::random(),
        }
    }

    pub fn new_stream(&self, payload_type: u8, clock_rate: u32) -> RtpStream {
        RtpStream {
            inner: Arc::new(StreamState {
                out: self.out.clone(),
                ssrc: self.ssrc,
                payload_type,
                clock_rate,
                cursor: Mutex::new(Cursor {
                    seq: rand::random(),
                    ts: 0,
                }),
            }),
        }
    }
}

#[derive(Clone)]
pub struct RtpStream {
    inner: Arc<StreamState>,
}

struct StreamState {
    out: WriteStream,
    ssrc: u32,
    payload_type: u8,
    clock_rate: u32,
    cursor: Mutex<Cursor>,
}

struct Cursor {
    seq: u16,
    ts: u32,
}

impl RtpStream {
    pub fn payload_type(&self) -> u8 {
        self.inner.payload_type
    }

    pub fn clock_rate(&self) -> u32 {
        self.inner.clock_rate
    }

    pub fn current_timestamp(&self) -> u32 {
        self.inner.cursor.lock().unwrap().ts
    }

    /// Emit one packet, advancing the timestamp by `ts_delta` ticks at the
    /// stream clock rate.
    pub async fn write_payload(&self, ts_delta: u32, marker: bool, payload: &[u8]) -> Result<()> {
        let (seq, ts) = {
            let mut cursor = self.inner.cursor.lock().unwrap();
            cursor.seq = cursor.seq.wrapping_add(1);
            cursor.ts = cursor.ts.wrapping_add(ts_delta);
            (cursor.seq, cursor.ts)
        };
        self.emit(seq, ts, marker, payload).await
    }

    /// Emit one packet at an absolute timestamp, used by the DTMF writer
    /// where every event of a digit shares the digit's start time.
    pub async fn write_payload_at(&self, ts: u32, marker: bool, payload: &[u8]) -> Result<()> {
        let seq = {
            let mut cursor = self.inner.cursor.lock().unwrap();
            cursor.seq = cursor.seq.wrapping_add(1);
            cursor.ts = ts;
            cursor.seq
        };
        self.emit(seq, ts, marker, payload).await
    }

    async fn emit(&self, seq: u16, ts: u32, marker: bool, payload: &[u8]) -> Result<()> {
        let header = RtpHeader {
            marker,
            payload_type: self.inner.payload_type,
            sequence_number: seq,
            timestamp: ts,
            ssrc: self.inner.ssrc,
        };
        self.inner.out.write_rtp(&header, payload).await
    }

    #[cfg(test)]
    pub(crate) fn set_cursor(&self, seq: u16, ts: u32) {
        let mut cursor = self.inner.cursor.lock().unwrap();
        cursor.seq = seq;
        cursor.ts = ts;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::net::UdpSocket;

    use super::super::channel::UdpChannel;
    use super::super::session::RtpSession;
    use super::*;
    use crate::stats::PortStats;

    async fn writer_and_peer() -> (SeqWriter, UdpSocket) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let channel = Arc::new(UdpChannel::new(socket));
        channel.set_dst(peer.local_addr().unwrap()).await;
        let session = RtpSession::new(channel, None, Arc::new(PortStats::default()));
        (SeqWriter::new(session.open_write_stream()), peer)
    }

    async fn recv_header(peer: &UdpSocket) -> RtpHeader {
        let mut buf = [0u8; 2048];
        let n = tokio::time::timeout(Duration::from_secs(1), peer.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        RtpHeader::parse(&buf[..n]).unwrap().0
    }

    #[tokio::test]
    async fn sequence_and_timestamp_advance() {
        let (writer, peer) = writer_and_peer().await;
        let stream = writer.new_stream(0, 8000);
        stream.set_cursor(100, 0);

        stream.write_payload(160, false, &[0; 160]).await.unwrap();
        stream.write_payload(160, false, &[0; 160]).await.unwrap();

        let first = recv_header(&peer).await;
        let second = recv_header(&peer).await;
        assert_eq!(first.sequence_number, 101);
        assert_eq!(second.sequence_number, 102);
        assert_eq!(first.timestamp, 160);
        assert_eq!(second.timestamp, 320);
        assert_eq!(first.ssrc, second.ssrc);
    }

    #[tokio::test]
    async fn sequence_wraps_and_timestamp_wraps() {
        let (writer, peer) = writer_and_peer().await;
        let stream = writer.new_stream(0, 8000);
        stream.set_cursor(u16::MAX, u32::MAX - 100);

        stream.write_payload(160, false, &[0; 160]).await.unwrap();
        let header = recv_header(&peer).await;
        assert_eq!(header.sequence_number, 0);
        assert_eq!(header.timestamp, 59);
    }

    #[tokio::test]
    async fn streams_share_ssrc_with_independent_cursors() {
        let (writer, peer) = writer_and_peer().await;
        let audio = writer.new_stream(0, 8000);
        let dtmf = writer.new_stream(101, 8000);
        audio.set_cursor(10, 0);
        dtmf.set_cursor(500, 0);

        audio.write_payload(160, false, &[0; 160]).await.unwrap();
        dtmf.write_payload_at(16000, true, &[1, 0x0a, 0x03, 0x20]).await.unwrap();

        let first = recv_header(&peer).await;
        let second = recv_header(&peer).await;
        assert_eq!(first.ssrc, second.ssrc);
        assert_eq!(first.payload_type, 0);
        assert_eq!(second.payload_type, 101);
        assert_eq!(second.sequence_number, 501);
        assert_eq!(second.timestamp, 16000);
        assert!(second.marker);
        assert_eq!(dtmf.current_timestamp(), 16000);
    }
}
