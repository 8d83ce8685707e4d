use std::f32::consts::TAU;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::audio::PcmWriter;
use crate::error::{Error, Result};
use crate::rtp::seq::RtpStream;
use crate::rtp::{RtpHandler, RtpHeader, DEF_FRAME_DUR};

/// telephone-event always runs at an 8 kHz clock (RFC 4733 §2.2.1).
pub const SAMPLE_RATE: u32 = 8000;
pub const SDP_NAME: &str = "telephone-event";

const TONE_DUR: Duration = Duration::from_millis(100);
const TONE_GAP: Duration = Duration::from_millis(50);
/// Tone duration in clock ticks; the packetization interval equals the
/// tone, so each digit is one begin event plus the end retransmissions.
const TONE_TICKS: u16 = 800;
const GAP_TICKS: u32 = 400;
const END_REPEATS: usize = 3;
/// Event volume field: 10 means -10 dBm0.
const EVENT_VOLUME: u8 = 10;
/// Per-component amplitude of the synthesized dual tone.
const TONE_AMPLITUDE: f32 = 0.25;

const END_BIT: u8 = 0x40;
const RESERVED_BIT: u8 = 0x80;
const VOLUME_MASK: u8 = 0x3f;

/// One decoded telephone-event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub code: u8,
    pub digit: char,
    pub volume: u8,
    /// Duration in clock ticks at 8 kHz.
    pub duration: u16,
    pub end: bool,
}

pub type DtmfCallback = Arc<dyn Fn(Event) + Send + Sync>;

const DIGITS: &[char] = &[
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', '*', '#', 'A', 'B', 'C', 'D',
];

fn digit_to_code(digit: char) -> Option<u8> {
    let code = DIGITS.iter().position(|&d| d == digit.to_ascii_uppercase())?;
    Some(code as u8)
}

fn code_to_digit(code: u8) -> Option<char> {
    DIGITS.get(code as usize).copied()
}

/// Row/column frequency pair of the keypad tone, in Hz.
fn tone_freqs(digit: char) -> Option<(f32, f32)> {
    let row = match digit.to_ascii_uppercase() {
        '1' | '2' | '3' | 'A' => 697.0,
        '4' | '5' | '6' | 'B' => 770.0,
        '7' | '8' | '9' | 'C' => 852.0,
        '*' | '0' | '#' | 'D' => 941.0,
        _ => return None,
    };
    let col = match digit.to_ascii_uppercase() {
        '1' | '4' | '7' | '*' => 1209.0,
        '2' | '5' | '8' | '0' => 1336.0,
        '3' | '6' | '9' | '#' => 1477.0,
        'A' | 'B' | 'C' | 'D' => 1633.0,
        _ => return None,
    };
    Some((row, col))
}

/// Parse an RFC 4733 payload. Packets may repeat the event block; the last
/// block carries the final state. Returns `None` for payloads that are not
/// well-formed telephone-events.
pub fn decode_rtp(payload: &[u8]) -> Option<Event> {
    if payload.len() < 4 || payload.len() % 4 != 0 {
        return None;
    }
    let mut event = None;
    for chunk in payload.chunks_exact(4) {
        if chunk[1] & RESERVED_BIT != 0 {
            return None;
        }
        let code = chunk[0];
        event = Some(Event {
            code,
            digit: code_to_digit(code)?,
            volume: chunk[1] & VOLUME_MASK,
            duration: u16::from_be_bytes([chunk[2], chunk[3]]),
            end: chunk[1] & END_BIT != 0,
        });
    }
    event
}

pub fn encode_event(event: &Event, buf: &mut [u8; 4]) {
    buf[0] = event.code;
    buf[1] = event.volume & VOLUME_MASK;
    if event.end {
        buf[1] |= END_BIT;
    }
    let [hi, lo] = event.duration.to_be_bytes();
    buf[2] = hi;
    buf[3] = lo;
}

/// Write a digit string as RFC 4733 events and/or audible tones.
///
/// Per digit: a begin packet (marker set) and three end retransmissions,
/// all stamped with the digit's start timestamp; the tone spans 800 ticks
/// with a 50 ms gap before the next digit. The audio sink, when present,
/// receives the synthesized dual tone for the same window. Cancelling the
/// token aborts mid-string; a partially played digit is permitted.
pub async fn write(
    cancel: &CancellationToken,
    audio: Option<&dyn PcmWriter>,
    rtp: Option<&RtpStream>,
    start_ts: u32,
    digits: &str,
) -> Result<()> {
    if audio.is_none() && rtp.is_none() {
        return Ok(());
    }
    let mut offset = 0u32;
    for digit in digits.chars() {
        let Some(code) = digit_to_code(digit) else {
            tracing::debug!(%digit, "skipping unknown DTMF digit");
            continue;
        };
        let ts = start_ts.wrapping_add(offset);
        if let Some(stream) = rtp {
            let mut buf = [0u8; 4];
            let mut event = Event {
                code,
                digit,
                volume: EVENT_VOLUME,
                duration: TONE_TICKS,
                end: false,
            };
            encode_event(&event, &mut buf);
            stream.write_payload_at(ts, true, &buf).await?;
            event.end = true;
            encode_event(&event, &mut buf);
            for _ in 0..END_REPEATS {
                stream.write_payload_at(ts, false, &buf).await?;
            }
        }
        match audio {
            Some(sink) => write_tone(cancel, sink, digit).await?,
            None => sleep_unless_cancelled(cancel, TONE_DUR).await?,
        }
        sleep_unless_cancelled(cancel, TONE_GAP).await?;
        offset = offset.wrapping_add(TONE_TICKS as u32 + GAP_TICKS);
    }
    Ok(())
}

/// Synthesize the keypad dual tone for one digit at the sink's sample
/// rate, paced in 20 ms frames.
async fn write_tone(cancel: &CancellationToken, sink: &dyn PcmWriter, digit: char) -> Result<()> {
    let Some((row, col)) = tone_freqs(digit) else {
        return Ok(());
    };
    let rate = sink.sample_rate();
    let total = (rate as u128 * TONE_DUR.as_micros() / 1_000_000) as usize;
    let frame_len = (rate as u128 * DEF_FRAME_DUR.as_micros() / 1_000_000) as usize;
    let scale = TONE_AMPLITUDE * i16::MAX as f32;

    let mut written = 0usize;
    while written < total {
        let len = frame_len.min(total - written);
        let frame: Vec<i16> = (written..written + len)
            .map(|i| {
                let t = i as f32 / rate as f32;
                (scale * ((TAU * row * t).sin() + (TAU * col * t).sin())) as i16
            })
            .collect();
        sink.write(&frame).await?;
        written += len;
        sleep_unless_cancelled(cancel, DEF_FRAME_DUR).await?;
    }
    Ok(())
}

async fn sleep_unless_cancelled(cancel: &CancellationToken, dur: Duration) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(dur) => Ok(()),
    }
}

/// Inbound telephone-event arm: fires the installed callback once per
/// event when the end bit is first observed; the retransmitted end packets
/// share the event timestamp and are deduplicated on it.
pub struct DtmfDecoder {
    callback: Arc<RwLock<Option<DtmfCallback>>>,
    last_fired: Option<(u32, u8)>,
}

impl DtmfDecoder {
    pub fn new(callback: Arc<RwLock<Option<DtmfCallback>>>) -> Self {
        Self {
            callback,
            last_fired: None,
        }
    }
}

#[async_trait]
impl RtpHandler for DtmfDecoder {
    async fn handle_rtp(&mut self, header: &RtpHeader, payload: &[u8]) -> Result<()> {
        let Some(event) = decode_rtp(payload) else {
            return Ok(());
        };
        if !event.end {
            return Ok(());
        }
        if self.last_fired == Some((header.timestamp, event.code)) {
            return Ok(());
        }
        self.last_fired = Some((header.timestamp, event.code));
        let callback = self.callback.read().unwrap().clone();
        if let Some(callback) = callback {
            callback(event);
        }
        Ok(())
    }

    fn pipeline(&self) -> String {
        SDP_NAME.to_string()
    }

    async fn close(&mut self) {}
}
