//! Media port core for a SIP telephony bridge.
//! One `MediaPort` per call leg negotiates codecs and transport via SDP,
//! terminates RTP/SRTP on a UDP socket, and bridges the wire to linear PCM
//! and RFC 4733 DTMF for the surrounding call controller.

mod net;

pub mod audio;
pub mod config;
pub mod dtmf;
pub mod error;
pub mod media;
pub mod rtp;
pub mod sdp;
pub mod srtp;
pub mod stats;

pub use config::{MediaOptions, PortRange};
pub use error::{Error, Result};
pub use media::{MediaConf, MediaPort};
pub use sdp::Encryption;
