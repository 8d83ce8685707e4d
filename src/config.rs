use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::stats::PortStats;

pub const DEFAULT_MEDIA_TIMEOUT_INITIAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MEDIA_TIMEOUT: Duration = Duration::from_secs(15);

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: 10000,
            max: 20000,
        }
    }
}

#[derive(Clone)]
pub struct MediaOptions {
    /// Address announced in SDP. May differ from the bind address when the
    /// bridge sits behind NAT.
    pub ip: IpAddr,
    pub ports: PortRange,
    /// Grace window after timeout enable while no packet was ever observed.
    pub media_timeout_initial: Duration,
    /// Steady-state inactivity bound once media has flowed.
    pub media_timeout: Duration,
    /// Shared counter sink; a private one is created when unset.
    pub stats: Option<Arc<PortStats>>,
    pub enable_jitter_buffer: bool,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ports: PortRange::default(),
            media_timeout_initial: DEFAULT_MEDIA_TIMEOUT_INITIAL,
            media_timeout: DEFAULT_MEDIA_TIMEOUT,
            stats: None,
            enable_jitter_buffer: false,
        }
    }
}

impl MediaOptions {
    /// Replace zero timeouts with the defaults, mirroring what the port
    /// constructor expects.
    pub(crate) fn normalized(mut self) -> Self {
        if self.media_timeout_initial.is_zero() {
            self.media_timeout_initial = DEFAULT_MEDIA_TIMEOUT_INITIAL;
        }
        if self.media_timeout.is_zero() {
            self.media_timeout = DEFAULT_MEDIA_TIMEOUT;
        }
        self
    }
}

impl std::fmt::Debug for MediaOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaOptions")
            .field("ip", &self.ip)
            .field("ports", &self.ports)
            .field("media_timeout_initial", &self.media_timeout_initial)
            .field("media_timeout", &self.media_timeout)
            .field("enable_jitter_buffer", &self.enable_jitter_buffer)
            .finish()
    }
}
