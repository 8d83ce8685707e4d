use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{PcmWriter, SwitchWriter};
use crate::error::{Error, Result};
use crate::rtp::seq::RtpStream;
use crate::rtp::{RtpHandler, RtpHeader, DEF_FRAME_DUR};

/// Static description of a negotiable audio codec.
#[derive(Debug, Clone, Copy)]
pub struct CodecInfo {
    pub sdp_name: &'static str,
    pub static_payload_type: Option<u8>,
    pub rtp_clock_rate: u32,
    pub sample_rate: u32,
    pub frame_dur: Duration,
}

/// A codec the port can terminate: it builds both ends of the media
/// pipeline around the negotiated payload type.
pub trait AudioCodec: Send + Sync + fmt::Debug {
    fn info(&self) -> CodecInfo;

    /// PCM → RTP: a writer that encodes frames onto the outbound stream.
    fn encode_rtp(&self, stream: RtpStream) -> Box<dyn PcmWriter>;

    /// RTP → PCM: a handler that decodes packets into the sink switch.
    fn decode_rtp(&self, sink: Arc<SwitchWriter>, payload_type: u8) -> Box<dyn RtpHandler>;
}

pub fn codec_by_payload_type(payload_type: u8) -> Option<&'static dyn AudioCodec> {
    match payload_type {
        0 => Some(&PCMU),
        8 => Some(&PCMA),
        _ => None,
    }
}

pub fn codec_by_name(name: &str) -> Option<&'static dyn AudioCodec> {
    if name.eq_ignore_ascii_case("PCMU") {
        Some(&PCMU)
    } else if name.eq_ignore_ascii_case("PCMA") {
        Some(&PCMA)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum G711Variant {
    Ulaw,
    Alaw,
}

#[derive(Debug)]
pub struct G711 {
    variant: G711Variant,
}

pub static PCMU: G711 = G711 {
    variant: G711Variant::Ulaw,
};

pub static PCMA: G711 = G711 {
    variant: G711Variant::Alaw,
};

impl G711 {
    fn compress(&self, sample: i16) -> u8 {
        match self.variant {
            G711Variant::Ulaw => ulaw_compress(sample),
            G711Variant::Alaw => alaw_compress(sample),
        }
    }

    fn expand(&self, byte: u8) -> i16 {
        match self.variant {
            G711Variant::Ulaw => ulaw_expand(byte),
            G711Variant::Alaw => alaw_expand(byte),
        }
    }
}

impl AudioCodec for G711 {
    fn info(&self) -> CodecInfo {
        match self.variant {
            G711Variant::Ulaw => CodecInfo {
                sdp_name: "PCMU",
                static_payload_type: Some(0),
                rtp_clock_rate: 8000,
                sample_rate: 8000,
                frame_dur: DEF_FRAME_DUR,
            },
            G711Variant::Alaw => CodecInfo {
                sdp_name: "PCMA",
                static_payload_type: Some(8),
                rtp_clock_rate: 8000,
                sample_rate: 8000,
                frame_dur: DEF_FRAME_DUR,
            },
        }
    }

    fn encode_rtp(&self, stream: RtpStream) -> Box<dyn PcmWriter> {
        Box::new(G711Encoder {
            codec: G711 {
                variant: self.variant,
            },
            stream,
        })
    }

    fn decode_rtp(&self, sink: Arc<SwitchWriter>, payload_type: u8) -> Box<dyn RtpHandler> {
        Box::new(G711Decoder {
            codec: G711 {
                variant: self.variant,
            },
            sink,
            payload_type,
        })
    }
}

struct G711Encoder {
    codec: G711,
    stream: RtpStream,
}

#[async_trait]
impl PcmWriter for G711Encoder {
    fn sample_rate(&self) -> u32 {
        self.codec.info().sample_rate
    }

    async fn write(&self, frame: &[i16]) -> Result<()> {
        if frame.is_empty() {
            return Ok(());
        }
        let encoded: Vec<u8> = frame.iter().map(|&s| self.codec.compress(s)).collect();
        // One sample per clock tick at 8 kHz.
        self.stream
            .write_payload(frame.len() as u32, false, &encoded)
            .await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct G711Decoder {
    codec: G711,
    sink: Arc<SwitchWriter>,
    payload_type: u8,
}

#[async_trait]
impl RtpHandler for G711Decoder {
    async fn handle_rtp(&mut self, header: &RtpHeader, payload: &[u8]) -> Result<()> {
        if header.payload_type != self.payload_type {
            return Err(Error::decode(format!(
                "unexpected payload type {} for {}",
                header.payload_type,
                self.codec.info().sdp_name
            )));
        }
        if payload.is_empty() {
            return Err(Error::decode("empty G.711 frame"));
        }
        let samples: Vec<i16> = payload.iter().map(|&b| self.codec.expand(b)).collect();
        self.sink.write(&samples).await
    }

    fn pipeline(&self) -> String {
        format!("{}-decode", self.codec.info().sdp_name)
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

// ITU-T G.711 companding, bit-exact with the reference STL implementation.
// Arithmetic is done in i32 to keep the intermediate shifts in range.

fn alaw_compress(sample: i16) -> u8 {
    let sample = sample as i32;
    let mut ix = if sample < 0 { (!sample) >> 4 } else { sample >> 4 };
    if ix > 15 {
        let mut iexp = 1;
        while ix > 16 + 15 {
            ix >>= 1;
            iexp += 1;
        }
        ix -= 16;
        ix += iexp << 4;
    }
    if sample >= 0 {
        ix |= 0x80;
    }
    (ix ^ 0x55) as u8
}

fn alaw_expand(byte: u8) -> i16 {
    let mut ix = (byte ^ 0x55) as i32;
    ix &= 0x7f;
    let iexp = ix >> 4;
    let mut mant = ix & 0x0f;
    if iexp > 0 {
        mant += 16;
    }
    mant = (mant << 4) + 0x08;
    if iexp > 1 {
        mant <<= iexp - 1;
    }
    if byte > 127 { mant as i16 } else { -mant as i16 }
}

fn ulaw_compress(sample: i16) -> u8 {
    let sample = sample as i32;
    let absno = if sample < 0 {
        ((!sample) >> 2) + 33
    } else {
        (sample >> 2) + 33
    };
    let absno = absno.min(0x1fff);

    let mut segno = 1;
    let mut i = absno >> 6;
    while i != 0 {
        segno += 1;
        i >>= 1;
    }

    let high_nibble = 0x08 - segno;
    let low_nibble = 0x0f - ((absno >> segno) & 0x0f);
    let mut result = (high_nibble << 4) | low_nibble;
    if sample >= 0 {
        result |= 0x80;
    }
    result as u8
}

fn ulaw_expand(byte: u8) -> i16 {
    let sign: i32 = if byte < 0x80 { -1 } else { 1 };
    let mantissa = !(byte as i32) & 0xff;
    let exponent = (mantissa >> 4) & 0x07;
    let segment = exponent + 1;
    let mantissa = mantissa & 0x0f;
    let step = 4 << segment;
    (sign * ((0x80 << exponent) + step * mantissa + step / 2 - 4 * 33)) as i16
}
