use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::audio::g711::{codec_by_name, codec_by_payload_type, AudioCodec};
use crate::dtmf;
use crate::error::{Error, Result};
use crate::srtp::{CryptoConf, CryptoProfile, KEYING_LEN};

/// SRTP negotiation stance for one offer/answer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    /// Reject any peer that insists on SRTP.
    Disabled,
    /// Offer and accept SRTP, but allow plain RTP.
    Allowed,
    /// Reject unencrypted peers.
    Required,
}

/// Negotiated media parameters for one call leg.
#[derive(Clone)]
pub struct MediaConfig {
    pub codec: &'static dyn AudioCodec,
    pub audio_type: u8,
    /// telephone-event payload type; 0 when the peer offered none.
    pub dtmf_type: u8,
    pub remote: SocketAddr,
    pub crypto: Option<CryptoConf>,
}

impl fmt::Debug for MediaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaConfig")
            .field("codec", &self.codec.info().sdp_name)
            .field("audio_type", &self.audio_type)
            .field("dtmf_type", &self.dtmf_type)
            .field("remote", &self.remote)
            .field("crypto", &self.crypto)
            .finish()
    }
}

const DTMF_PAYLOAD_TYPE: u8 = 101;

#[derive(Debug, Clone)]
struct CryptoAttr {
    tag: u32,
    suite: String,
    key: Vec<u8>,
}

impl CryptoAttr {
    fn format(&self) -> String {
        format!(
            "a=crypto:{} {} inline:{}",
            self.tag,
            self.suite,
            BASE64.encode(&self.key)
        )
    }

    /// Parse the value of an `a=crypto:` attribute, e.g.
    /// `1 AES_CM_128_HMAC_SHA1_80 inline:<base64>[|lifetime|mki]`.
    fn parse(value: &str) -> Result<Self> {
        let mut parts = value.split_whitespace();
        let tag = parts
            .next()
            .and_then(|t| t.parse::<u32>().ok())
            .ok_or_else(|| Error::rejected("invalid crypto attribute tag"))?;
        let suite = parts
            .next()
            .ok_or_else(|| Error::rejected("missing crypto suite"))?
            .to_string();
        let key_param = parts
            .next()
            .ok_or_else(|| Error::rejected("missing crypto key parameters"))?;
        let inline = key_param
            .strip_prefix("inline:")
            .ok_or_else(|| Error::rejected("only inline SDES keys are supported"))?;
        let material = inline.split('|').next().unwrap_or(inline);
        let key = BASE64
            .decode(material)
            .map_err(|err| Error::rejected(format!("invalid SDES key material: {err}")))?;
        Ok(Self { tag, suite, key })
    }
}

#[derive(Debug, Clone)]
struct MediaDesc {
    addr: IpAddr,
    port: u16,
    secure_proto: bool,
    payloads: Vec<u8>,
    rtpmap: HashMap<u8, (String, u32)>,
    crypto: Vec<CryptoAttr>,
}

impl MediaDesc {
    fn remote(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// First offered payload the registry can terminate.
    fn select_codec(&self) -> Option<(&'static dyn AudioCodec, u8)> {
        for &pt in &self.payloads {
            if let Some(codec) = codec_by_payload_type(pt) {
                return Some((codec, pt));
            }
            if let Some((name, rate)) = self.rtpmap.get(&pt) {
                if let Some(codec) = codec_by_name(name) {
                    if codec.info().rtp_clock_rate == *rate {
                        return Some((codec, pt));
                    }
                }
            }
        }
        None
    }

    fn dtmf_type(&self) -> u8 {
        for &pt in &self.payloads {
            if let Some((name, rate)) = self.rtpmap.get(&pt) {
                if name.eq_ignore_ascii_case(dtmf::SDP_NAME) && *rate == dtmf::SAMPLE_RATE {
                    return pt;
                }
            }
        }
        0
    }
}

fn parse_media_desc(data: &[u8]) -> Result<MediaDesc> {
    let body = std::str::from_utf8(data).map_err(|_| Error::rejected("SDP is not valid UTF-8"))?;

    let mut addr: Option<IpAddr> = None;
    let mut port: Option<u16> = None;
    let mut secure_proto = false;
    let mut payloads: Vec<u8> = Vec::new();
    let mut rtpmap: HashMap<u8, (String, u32)> = HashMap::new();
    let mut crypto: Vec<CryptoAttr> = Vec::new();

    for line in body.lines() {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("c=IN IP4 ") {
            addr = Some(
                rest.trim()
                    .parse::<std::net::Ipv4Addr>()
                    .map(IpAddr::V4)
                    .map_err(|err| Error::rejected(format!("invalid connection address: {err}")))?,
            );
            continue;
        }
        if let Some(rest) = line.strip_prefix("c=IN IP6 ") {
            addr = Some(
                rest.trim()
                    .parse::<std::net::Ipv6Addr>()
                    .map(IpAddr::V6)
                    .map_err(|err| Error::rejected(format!("invalid connection address: {err}")))?,
            );
            continue;
        }
        if let Some(rest) = line.strip_prefix("m=audio ") {
            let mut parts = rest.split_whitespace();
            port = Some(
                parts
                    .next()
                    .and_then(|p| p.parse::<u16>().ok())
                    .ok_or_else(|| Error::rejected("missing port in m=audio"))?,
            );
            let proto = parts
                .next()
                .ok_or_else(|| Error::rejected("missing transport protocol in m=audio"))?;
            secure_proto = proto.contains("SAVP");
            payloads = parts.filter_map(|fmt| fmt.parse::<u8>().ok()).collect();
            continue;
        }
        if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            let mut parts = rest.split_whitespace();
            let Some(pt) = parts.next().and_then(|p| p.parse::<u8>().ok()) else {
                continue;
            };
            let Some(codec) = parts.next() else { continue };
            let mut codec_parts = codec.split('/');
            let name = codec_parts.next().unwrap_or_default().to_string();
            let rate = codec_parts
                .next()
                .and_then(|r| r.parse::<u32>().ok())
                .unwrap_or(0);
            rtpmap.insert(pt, (name, rate));
            continue;
        }
        if let Some(rest) = line.strip_prefix("a=crypto:") {
            crypto.push(CryptoAttr::parse(rest)?);
            continue;
        }
    }

    Ok(MediaDesc {
        addr: addr.ok_or_else(|| Error::rejected("SDP has no connection address"))?,
        port: port.ok_or_else(|| Error::rejected("SDP has no audio media section"))?,
        secure_proto,
        payloads,
        rtpmap,
        crypto,
    })
}

fn connection_line(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(ip) => format!("c=IN IP4 {ip}"),
        IpAddr::V6(ip) => format!("c=IN IP6 {ip}"),
    }
}

fn origin_line(sid: u64, addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(ip) => format!("o=- {sid} 0 IN IP4 {ip}"),
        IpAddr::V6(ip) => format!("o=- {sid} 0 IN IP6 {ip}"),
    }
}

fn session_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn new_keying() -> Vec<u8> {
    (0..KEYING_LEN).map(|_| rand::random::<u8>()).collect()
}

/// Our outgoing offer, or a parsed peer offer awaiting an answer.
#[derive(Debug, Clone)]
pub struct Offer {
    pub sdp: String,
    media: MediaDesc,
    /// Keying material we offered; set only on locally generated offers.
    local_crypto: Option<(CryptoProfile, Vec<u8>)>,
}

impl Offer {
    /// Generate an offer announcing PCMU plus telephone-event on the given
    /// address.
    pub fn new(addr: IpAddr, port: u16, enc: Encryption) -> Result<Offer> {
        let local_crypto = match enc {
            Encryption::Disabled => None,
            Encryption::Allowed | Encryption::Required => {
                Some((CryptoProfile::AesCm128HmacSha1_80, new_keying()))
            }
        };
        let proto = if enc == Encryption::Required {
            "RTP/SAVP"
        } else {
            "RTP/AVP"
        };

        let mut lines = vec![
            "v=0".to_string(),
            origin_line(session_id(), addr),
            "s=-".to_string(),
            connection_line(addr),
            "t=0 0".to_string(),
            format!("m=audio {port} {proto} 0 {DTMF_PAYLOAD_TYPE}"),
            "a=rtpmap:0 PCMU/8000".to_string(),
            format!("a=rtpmap:{DTMF_PAYLOAD_TYPE} {}/{}", dtmf::SDP_NAME, dtmf::SAMPLE_RATE),
            format!("a=fmtp:{DTMF_PAYLOAD_TYPE} 0-16"),
        ];
        let mut crypto_attrs = Vec::new();
        if let Some((profile, key)) = &local_crypto {
            let attr = CryptoAttr {
                tag: 1,
                suite: profile.sdp_name().to_string(),
                key: key.clone(),
            };
            lines.push(attr.format());
            crypto_attrs.push(attr);
        }
        lines.push("a=sendrecv".to_string());
        let sdp = lines.join("\r\n") + "\r\n";

        Ok(Offer {
            media: MediaDesc {
                addr,
                port,
                secure_proto: proto == "RTP/SAVP",
                payloads: vec![0, DTMF_PAYLOAD_TYPE],
                rtpmap: HashMap::from([
                    (0, ("PCMU".to_string(), 8000)),
                    (
                        DTMF_PAYLOAD_TYPE,
                        (dtmf::SDP_NAME.to_string(), dtmf::SAMPLE_RATE),
                    ),
                ]),
                crypto: crypto_attrs,
            },
            sdp,
            local_crypto,
        })
    }

    /// Parse a peer's offer.
    pub fn parse(data: &[u8]) -> Result<Offer> {
        let media = parse_media_desc(data)?;
        Ok(Offer {
            sdp: String::from_utf8_lossy(data).into_owned(),
            media,
            local_crypto: None,
        })
    }

    /// Answer a peer offer, narrowing to one codec and settling the crypto
    /// question per the encryption stance.
    pub fn answer(
        &self,
        addr: IpAddr,
        port: u16,
        enc: Encryption,
    ) -> Result<(Answer, MediaConfig)> {
        let (codec, audio_type) = self
            .media
            .select_codec()
            .ok_or_else(|| Error::rejected("no common audio codec in offer"))?;
        let dtmf_type = self.media.dtmf_type();

        let offered_crypto = self.media.crypto.iter().find_map(|attr| {
            CryptoProfile::from_sdp_name(&attr.suite).map(|profile| (attr, profile))
        });
        let crypto = match (offered_crypto, enc) {
            (Some(_), Encryption::Disabled) => {
                if self.media.secure_proto {
                    return Err(Error::rejected("peer requires SRTP, encryption is disabled"));
                }
                None
            }
            (Some((attr, profile)), _) => {
                if attr.key.len() != KEYING_LEN {
                    return Err(Error::rejected("peer SDES key has wrong length"));
                }
                Some((attr.tag, profile, attr.key.clone()))
            }
            (None, Encryption::Required) => {
                return Err(Error::rejected("peer offered no SRTP, encryption is required"));
            }
            (None, _) => {
                if self.media.secure_proto {
                    return Err(Error::rejected("secure transport without crypto attributes"));
                }
                None
            }
        };

        let proto = if self.media.secure_proto {
            "RTP/SAVP"
        } else {
            "RTP/AVP"
        };
        let mut formats = audio_type.to_string();
        if dtmf_type != 0 {
            formats = format!("{formats} {dtmf_type}");
        }

        let mut lines = vec![
            "v=0".to_string(),
            origin_line(session_id(), addr),
            "s=-".to_string(),
            connection_line(addr),
            "t=0 0".to_string(),
            format!("m=audio {port} {proto} {formats}"),
            format!(
                "a=rtpmap:{audio_type} {}/{}",
                codec.info().sdp_name,
                codec.info().rtp_clock_rate
            ),
        ];
        if dtmf_type != 0 {
            lines.push(format!(
                "a=rtpmap:{dtmf_type} {}/{}",
                dtmf::SDP_NAME,
                dtmf::SAMPLE_RATE
            ));
            lines.push(format!("a=fmtp:{dtmf_type} 0-16"));
        }

        let crypto_conf = match crypto {
            Some((tag, profile, remote_key)) => {
                let local_key = new_keying();
                lines.push(
                    CryptoAttr {
                        tag,
                        suite: profile.sdp_name().to_string(),
                        key: local_key.clone(),
                    }
                    .format(),
                );
                Some(CryptoConf {
                    profile,
                    local_key,
                    remote_key,
                })
            }
            None => None,
        };
        lines.push("a=sendrecv".to_string());
        let sdp = lines.join("\r\n") + "\r\n";

        let answer = Answer {
            sdp,
            media: MediaDesc {
                addr,
                port,
                secure_proto: self.media.secure_proto,
                payloads: if dtmf_type != 0 {
                    vec![audio_type, dtmf_type]
                } else {
                    vec![audio_type]
                },
                rtpmap: HashMap::new(),
                crypto: Vec::new(),
            },
        };
        let config = MediaConfig {
            codec,
            audio_type,
            dtmf_type,
            remote: self.media.remote(),
            crypto: crypto_conf,
        };
        Ok((answer, config))
    }
}

/// A peer's answer to our offer.
#[derive(Debug, Clone)]
pub struct Answer {
    pub sdp: String,
    media: MediaDesc,
}

impl Answer {
    pub fn parse(data: &[u8]) -> Result<Answer> {
        let media = parse_media_desc(data)?;
        Ok(Answer {
            sdp: String::from_utf8_lossy(data).into_owned(),
            media,
        })
    }

    /// Apply the answer against the offer it responds to, producing the
    /// negotiated configuration.
    pub fn apply(&self, offer: &Offer, enc: Encryption) -> Result<MediaConfig> {
        let (codec, audio_type) = self
            .media
            .select_codec()
            .ok_or_else(|| Error::rejected("answer selected no known audio codec"))?;
        let dtmf_type = self.media.dtmf_type();

        let answered_crypto = self
            .media
            .crypto
            .iter()
            .find(|attr| CryptoProfile::from_sdp_name(&attr.suite).is_some());
        let crypto = match answered_crypto {
            Some(attr) => {
                if enc == Encryption::Disabled {
                    return Err(Error::rejected("answer carries SRTP, encryption is disabled"));
                }
                let Some((profile, local_key)) = offer.local_crypto.as_ref() else {
                    return Err(Error::rejected("answer carries SRTP we never offered"));
                };
                if attr.suite != profile.sdp_name() {
                    return Err(Error::rejected(format!(
                        "answer crypto suite {} does not match offer",
                        attr.suite
                    )));
                }
                if attr.key.len() != KEYING_LEN {
                    return Err(Error::rejected("peer SDES key has wrong length"));
                }
                Some(CryptoConf {
                    profile: *profile,
                    local_key: local_key.clone(),
                    remote_key: attr.key.clone(),
                })
            }
            None => {
                if enc == Encryption::Required {
                    return Err(Error::rejected("answer has no SRTP, encryption is required"));
                }
                None
            }
        };

        Ok(MediaConfig {
            codec,
            audio_type,
            dtmf_type,
            remote: self.media.remote(),
            crypto,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER_ADDR: &str = "10.0.0.1";

    fn offer(enc: Encryption) -> Offer {
        Offer::new(OFFER_ADDR.parse().unwrap(), 20000, enc).unwrap()
    }

    #[test]
    fn offer_advertises_pcmu_and_dtmf() {
        let offer = offer(Encryption::Disabled);
        assert!(offer.sdp.contains("c=IN IP4 10.0.0.1"));
        assert!(offer.sdp.contains("m=audio 20000 RTP/AVP 0 101"));
        assert!(offer.sdp.contains("a=rtpmap:0 PCMU/8000"));
        assert!(offer.sdp.contains("a=rtpmap:101 telephone-event/8000"));
        assert!(!offer.sdp.contains("a=crypto"));
    }

    #[test]
    fn offer_roundtrip_negotiates_pcmu() {
        let offer = offer(Encryption::Disabled);
        let parsed = Offer::parse(offer.sdp.as_bytes()).unwrap();
        let (answer, config) = parsed
            .answer("10.0.0.2".parse().unwrap(), 30000, Encryption::Disabled)
            .unwrap();

        assert_eq!(config.audio_type, 0);
        assert_eq!(config.codec.info().sdp_name, "PCMU");
        assert_eq!(config.dtmf_type, 101);
        assert_eq!(config.remote, "10.0.0.1:20000".parse().unwrap());
        assert!(config.crypto.is_none());
        assert!(answer.sdp.contains("m=audio 30000 RTP/AVP 0 101"));
    }

    #[test]
    fn answer_applies_to_offer() {
        let our_offer = offer(Encryption::Disabled);
        let peer = Offer::parse(our_offer.sdp.as_bytes()).unwrap();
        let (answer, _) = peer
            .answer("192.0.2.5".parse().unwrap(), 30000, Encryption::Disabled)
            .unwrap();

        let parsed = Answer::parse(answer.sdp.as_bytes()).unwrap();
        let config = parsed.apply(&our_offer, Encryption::Disabled).unwrap();
        assert_eq!(config.audio_type, 0);
        assert_eq!(config.dtmf_type, 101);
        assert_eq!(config.remote, "192.0.2.5:30000".parse().unwrap());
    }

    #[test]
    fn pcma_offer_is_accepted() {
        let sdp = concat!(
            "v=0\r\n",
            "o=- 1 0 IN IP4 198.51.100.7\r\n",
            "s=-\r\n",
            "c=IN IP4 198.51.100.7\r\n",
            "t=0 0\r\n",
            "m=audio 40000 RTP/AVP 8\r\n",
            "a=rtpmap:8 PCMA/8000\r\n",
        );
        let peer = Offer::parse(sdp.as_bytes()).unwrap();
        let (_, config) = peer
            .answer("10.0.0.2".parse().unwrap(), 30000, Encryption::Disabled)
            .unwrap();
        assert_eq!(config.codec.info().sdp_name, "PCMA");
        assert_eq!(config.audio_type, 8);
        assert_eq!(config.dtmf_type, 0);
    }

    #[test]
    fn unknown_codecs_are_rejected() {
        let sdp = concat!(
            "v=0\r\n",
            "c=IN IP4 198.51.100.7\r\n",
            "m=audio 40000 RTP/AVP 96\r\n",
            "a=rtpmap:96 opus/48000\r\n",
        );
        let peer = Offer::parse(sdp.as_bytes()).unwrap();
        assert!(matches!(
            peer.answer("10.0.0.2".parse().unwrap(), 30000, Encryption::Disabled),
            Err(Error::ConfigRejected(_))
        ));
    }

    #[test]
    fn crypto_negotiation_modes() {
        // required ↔ required: both sides keyed.
        let our_offer = offer(Encryption::Required);
        assert!(our_offer.sdp.contains("RTP/SAVP"));
        assert!(our_offer.sdp.contains("a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:"));

        let peer = Offer::parse(our_offer.sdp.as_bytes()).unwrap();
        let (answer, peer_config) = peer
            .answer("10.0.0.2".parse().unwrap(), 30000, Encryption::Required)
            .unwrap();
        let peer_crypto = peer_config.crypto.as_ref().unwrap();

        let parsed = Answer::parse(answer.sdp.as_bytes()).unwrap();
        let our_config = parsed.apply(&our_offer, Encryption::Required).unwrap();
        let our_crypto = our_config.crypto.as_ref().unwrap();

        // Each side's local key is the other's remote key.
        assert_eq!(our_crypto.local_key, peer_crypto.remote_key);
        assert_eq!(our_crypto.remote_key, peer_crypto.local_key);
    }

    #[test]
    fn disabled_rejects_secure_offer() {
        let our_offer = offer(Encryption::Required);
        let peer = Offer::parse(our_offer.sdp.as_bytes()).unwrap();
        assert!(matches!(
            peer.answer("10.0.0.2".parse().unwrap(), 30000, Encryption::Disabled),
            Err(Error::ConfigRejected(_))
        ));
    }

    #[test]
    fn required_rejects_plain_offer() {
        let our_offer = offer(Encryption::Disabled);
        let peer = Offer::parse(our_offer.sdp.as_bytes()).unwrap();
        assert!(matches!(
            peer.answer("10.0.0.2".parse().unwrap(), 30000, Encryption::Required),
            Err(Error::ConfigRejected(_))
        ));
    }

    #[test]
    fn required_rejects_plain_answer() {
        let our_offer = offer(Encryption::Required);
        let plain_answer = concat!(
            "v=0\r\n",
            "c=IN IP4 192.0.2.5\r\n",
            "m=audio 30000 RTP/AVP 0\r\n",
            "a=rtpmap:0 PCMU/8000\r\n",
        );
        let parsed = Answer::parse(plain_answer.as_bytes()).unwrap();
        assert!(matches!(
            parsed.apply(&our_offer, Encryption::Required),
            Err(Error::ConfigRejected(_))
        ));
    }

    #[test]
    fn allowed_accepts_plain_answer() {
        let our_offer = offer(Encryption::Allowed);
        assert!(our_offer.sdp.contains("RTP/AVP"));
        assert!(our_offer.sdp.contains("a=crypto"));
        let plain_answer = concat!(
            "v=0\r\n",
            "c=IN IP4 192.0.2.5\r\n",
            "m=audio 30000 RTP/AVP 0\r\n",
            "a=rtpmap:0 PCMU/8000\r\n",
        );
        let parsed = Answer::parse(plain_answer.as_bytes()).unwrap();
        let config = parsed.apply(&our_offer, Encryption::Allowed).unwrap();
        assert!(config.crypto.is_none());
    }

    #[test]
    fn malformed_sdp_is_rejected() {
        assert!(Offer::parse(b"v=0\r\ns=-\r\n").is_err());
        assert!(Answer::parse(b"m=audio nonsense RTP/AVP 0\r\nc=IN IP4 1.2.3.4\r\n").is_err());
    }
}
