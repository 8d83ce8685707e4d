pub mod channel;
pub mod jitter;
pub mod mux;
pub mod seq;
pub mod session;

use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

/// Largest datagram accepted; anything above is counted and dropped.
pub const MTU_SIZE: usize = 1500;

/// Packetization interval shared by the built-in audio codecs.
pub const DEF_FRAME_DUR: Duration = Duration::from_millis(20);

pub const RTP_VERSION: u8 = 2;
pub const MIN_HEADER_SIZE: usize = 12;

/// Fixed RTP header fields this port reads and writes. CSRC entries and
/// header extensions are skipped on parse and never emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Parse a datagram, returning the header and the payload range with
    /// CSRC list, extension block, and padding already accounted for.
    pub fn parse(data: &[u8]) -> Result<(Self, Range<usize>)> {
        if data.len() < MIN_HEADER_SIZE {
            return Err(Error::decode(format!(
                "RTP packet too short: {} bytes",
                data.len()
            )));
        }
        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(Error::decode(format!("invalid RTP version: {version}")));
        }
        let padding = data[0] & 0x20 != 0;
        let extension = data[0] & 0x10 != 0;
        let cc = (data[0] & 0x0f) as usize;
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7f;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut start = MIN_HEADER_SIZE + cc * 4;
        if data.len() < start {
            return Err(Error::decode("RTP packet truncated in CSRC list"));
        }
        if extension {
            if data.len() < start + 4 {
                return Err(Error::decode("RTP packet truncated in extension header"));
            }
            let words = u16::from_be_bytes([data[start + 2], data[start + 3]]) as usize;
            start += 4 + words * 4;
            if data.len() < start {
                return Err(Error::decode("RTP packet truncated in extension data"));
            }
        }
        let mut end = data.len();
        if padding {
            let pad = data[end - 1] as usize;
            if pad == 0 || start + pad > end {
                return Err(Error::decode("invalid RTP padding length"));
            }
            end -= pad;
        }

        Ok((
            Self {
                marker,
                payload_type,
                sequence_number,
                timestamp,
                ssrc,
            },
            start..end,
        ))
    }

    /// Serialize the fixed 12-byte header: version 2, no padding, no
    /// extension, empty CSRC list.
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.reserve(MIN_HEADER_SIZE);
        buf.put_u8(RTP_VERSION << 6);
        let mut second = self.payload_type & 0x7f;
        if self.marker {
            second |= 0x80;
        }
        buf.put_u8(second);
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }
}

/// Inbound packet processor. Handlers form chains (counters, decoders,
/// jitter adapters); close must be idempotent and cascade.
#[async_trait]
pub trait RtpHandler: Send {
    async fn handle_rtp(&mut self, header: &RtpHeader, payload: &[u8]) -> Result<()>;

    /// Identity string used when logging persistent decode failures.
    fn pipeline(&self) -> String;

    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = RtpHeader {
            marker: true,
            payload_type: 101,
            sequence_number: 4097,
            timestamp: 160_000,
            ssrc: 0xabcd_ef01,
        };
        let mut buf = BytesMut::new();
        header.serialize(&mut buf);
        buf.extend_from_slice(&[1, 2, 3, 4]);

        let (parsed, payload) = RtpHeader::parse(&buf).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(&buf[payload], &[1, 2, 3, 4]);
    }

    #[test]
    fn rejects_wrong_version() {
        let mut data = [0u8; 16];
        data[0] = 1 << 6;
        assert!(RtpHeader::parse(&data).is_err());
    }

    #[test]
    fn rejects_short_packet() {
        assert!(RtpHeader::parse(&[0x80, 0, 0]).is_err());
    }

    #[test]
    fn skips_csrc_and_strips_padding() {
        let mut buf = BytesMut::new();
        // V=2, P=1, CC=1
        buf.put_u8((RTP_VERSION << 6) | 0x20 | 0x01);
        buf.put_u8(0);
        buf.put_u16(7);
        buf.put_u32(1000);
        buf.put_u32(0x1111_2222);
        buf.put_u32(0x3333_4444); // CSRC
        buf.extend_from_slice(&[9, 9, 0, 0, 2]); // payload + 2 padding bytes

        let (header, payload) = RtpHeader::parse(&buf).unwrap();
        assert_eq!(header.sequence_number, 7);
        assert_eq!(&buf[payload], &[9, 9, 0]);
    }
}
