use std::collections::HashMap;
use std::sync::Mutex;

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use ctr::Ctr64BE;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::{Error, Result};
use crate::rtp::RtpHeader;

type Aes128Ctr64BE = Ctr64BE<Aes128>;
type HmacSha1 = Hmac<Sha1>;

pub const MASTER_KEY_LEN: usize = 16;
pub const MASTER_SALT_LEN: usize = 14;
/// Concatenated master key and salt as carried in SDES key material.
pub const KEYING_LEN: usize = MASTER_KEY_LEN + MASTER_SALT_LEN;

const LABEL_RTP_ENCRYPTION: u8 = 0x00;
const LABEL_RTP_AUTH: u8 = 0x01;
const LABEL_RTP_SALT: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoProfile {
    AesCm128HmacSha1_80,
}

impl CryptoProfile {
    pub fn sdp_name(&self) -> &'static str {
        match self {
            Self::AesCm128HmacSha1_80 => "AES_CM_128_HMAC_SHA1_80",
        }
    }

    pub fn from_sdp_name(name: &str) -> Option<Self> {
        match name {
            "AES_CM_128_HMAC_SHA1_80" => Some(Self::AesCm128HmacSha1_80),
            _ => None,
        }
    }

    pub fn tag_len(&self) -> usize {
        match self {
            Self::AesCm128HmacSha1_80 => 10,
        }
    }
}

/// Negotiated SRTP keying: one master key ‖ salt per direction.
#[derive(Clone)]
pub struct CryptoConf {
    pub profile: CryptoProfile,
    pub local_key: Vec<u8>,
    pub remote_key: Vec<u8>,
}

impl std::fmt::Debug for CryptoConf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoConf")
            .field("profile", &self.profile)
            .field("local_key", &"<redacted>")
            .field("remote_key", &"<redacted>")
            .finish()
    }
}

/// SRTP protect/unprotect for one session: the local key drives the
/// outbound direction, the remote key authenticates inbound.
pub struct SrtpSession {
    tx: Mutex<StreamContext>,
    rx: Mutex<StreamContext>,
}

impl SrtpSession {
    pub fn new(conf: &CryptoConf) -> Result<Self> {
        Ok(Self {
            tx: Mutex::new(StreamContext::new(conf.profile, &conf.local_key)?),
            rx: Mutex::new(StreamContext::new(conf.profile, &conf.remote_key)?),
        })
    }

    /// Encrypt the payload in place and append the auth tag.
    pub fn protect(&self, packet: &mut Vec<u8>) -> Result<()> {
        self.tx.lock().expect("srtp tx lock").protect(packet)
    }

    /// Verify and decrypt one inbound datagram, returning the plain RTP
    /// packet.
    pub fn unprotect(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.rx.lock().expect("srtp rx lock").unprotect(data)
    }
}

struct StreamContext {
    session_key: [u8; 16],
    session_salt: [u8; 14],
    auth_key: [u8; 20],
    tag_len: usize,
    /// Rollover counter and last sequence number per SSRC.
    rollover: HashMap<u32, RocState>,
}

#[derive(Clone, Copy)]
struct RocState {
    roc: u32,
    last_seq: u16,
}

impl StreamContext {
    fn new(profile: CryptoProfile, keying: &[u8]) -> Result<Self> {
        if keying.len() != KEYING_LEN {
            return Err(Error::rejected(format!(
                "SRTP keying material must be {KEYING_LEN} bytes, got {}",
                keying.len()
            )));
        }
        let master_key: [u8; MASTER_KEY_LEN] = keying[..MASTER_KEY_LEN].try_into().expect("len");
        let master_salt: [u8; MASTER_SALT_LEN] =
            keying[MASTER_KEY_LEN..].try_into().expect("len");

        let mut session_key = [0u8; 16];
        let mut auth_key = [0u8; 20];
        let mut session_salt = [0u8; 14];
        derive_key(&master_key, &master_salt, LABEL_RTP_ENCRYPTION, &mut session_key);
        derive_key(&master_key, &master_salt, LABEL_RTP_AUTH, &mut auth_key);
        derive_key(&master_key, &master_salt, LABEL_RTP_SALT, &mut session_salt);

        Ok(Self {
            session_key,
            session_salt,
            auth_key,
            tag_len: profile.tag_len(),
            rollover: HashMap::new(),
        })
    }

    fn protect(&mut self, packet: &mut Vec<u8>) -> Result<()> {
        let (header, payload) = RtpHeader::parse(packet)?;
        let roc = self.advance_roc(header.ssrc, header.sequence_number);
        self.apply_keystream(
            header.ssrc,
            roc,
            header.sequence_number,
            &mut packet[payload],
        );
        let tag = self.auth_tag(packet, roc);
        packet.extend_from_slice(&tag[..self.tag_len]);
        Ok(())
    }

    fn unprotect(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < self.tag_len {
            return Err(Error::decode("SRTP packet shorter than auth tag"));
        }
        let (body, tag) = data.split_at(data.len() - self.tag_len);
        let (header, payload) = RtpHeader::parse(body)?;
        let roc = self.guess_roc(header.ssrc, header.sequence_number);
        let expected = self.auth_tag(body, roc);
        if !tag_eq(&expected[..self.tag_len], tag) {
            return Err(Error::decode("SRTP auth tag mismatch"));
        }
        self.commit_roc(header.ssrc, header.sequence_number, roc);

        let mut plain = body.to_vec();
        self.apply_keystream(header.ssrc, roc, header.sequence_number, &mut plain[payload]);
        Ok(plain)
    }

    /// AES-CM keystream over the payload, IV per RFC 3711 §4.1.1:
    /// (salt << 16) ^ (ssrc << 64) ^ (index << 16).
    fn apply_keystream(&self, ssrc: u32, roc: u32, seq: u16, payload: &mut [u8]) {
        let mut iv = [0u8; 16];
        iv[..14].copy_from_slice(&self.session_salt);
        for (dst, src) in iv[4..8].iter_mut().zip(ssrc.to_be_bytes()) {
            *dst ^= src;
        }
        let index = ((roc as u64) << 16) | seq as u64;
        for (dst, src) in iv[8..14].iter_mut().zip(&index.to_be_bytes()[2..8]) {
            *dst ^= src;
        }
        let mut cipher = Aes128Ctr64BE::new((&self.session_key).into(), (&iv).into());
        cipher.apply_keystream(payload);
    }

    fn auth_tag(&self, body: &[u8], roc: u32) -> [u8; 20] {
        let mut mac = HmacSha1::new_from_slice(&self.auth_key).expect("hmac accepts any key length");
        mac.update(body);
        mac.update(&roc.to_be_bytes());
        mac.finalize().into_bytes().into()
    }

    fn advance_roc(&mut self, ssrc: u32, seq: u16) -> u32 {
        let roc = self.guess_roc(ssrc, seq);
        self.commit_roc(ssrc, seq, roc);
        roc
    }

    fn guess_roc(&self, ssrc: u32, seq: u16) -> u32 {
        match self.rollover.get(&ssrc) {
            None => 0,
            Some(state) => {
                if seq < 0x1000 && state.last_seq > 0xf000 {
                    state.roc.wrapping_add(1)
                } else {
                    state.roc
                }
            }
        }
    }

    fn commit_roc(&mut self, ssrc: u32, seq: u16, roc: u32) {
        let state = self.rollover.entry(ssrc).or_insert(RocState { roc, last_seq: seq });
        if roc > state.roc || seq_newer(seq, state.last_seq) {
            state.roc = roc;
            state.last_seq = seq;
        }
    }
}

fn seq_newer(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

fn tag_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// RFC 3711 §4.3 AES-CM key derivation with a zero derivation rate: the
/// label is XORed into byte 7 of the salt-extended IV.
fn derive_key(master_key: &[u8; 16], master_salt: &[u8; 14], label: u8, out: &mut [u8]) {
    let mut iv = [0u8; 16];
    iv[..14].copy_from_slice(master_salt);
    iv[7] ^= label;
    out.fill(0);
    let mut cipher = Aes128Ctr64BE::new(master_key.into(), (&iv).into());
    cipher.apply_keystream(out);
}
