use std::sync::atomic::AtomicU64;

/// Read-only counters exposed to the call supervisor. All counters are
/// monotonic; readers use relaxed loads.
#[derive(Debug, Default)]
pub struct PortStats {
    pub streams: AtomicU64,
    pub packets: AtomicU64,
    pub ignored_packets: AtomicU64,
    pub input_packets: AtomicU64,

    pub mux_packets: AtomicU64,
    pub mux_bytes: AtomicU64,

    pub audio_packets: AtomicU64,
    pub audio_bytes: AtomicU64,

    pub dtmf_packets: AtomicU64,
    pub dtmf_bytes: AtomicU64,
}
