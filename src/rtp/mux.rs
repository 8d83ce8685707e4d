use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::{RtpHandler, RtpHeader};
use crate::error::Result;
use crate::stats::PortStats;

/// Routes inbound packets by payload type. Unknown payload types fall to
/// the default arm, or are dropped when none is set.
pub struct Mux {
    arms: HashMap<u8, Box<dyn RtpHandler>>,
    default: Option<Box<dyn RtpHandler>>,
    closed: bool,
}

impl Mux {
    pub fn new() -> Self {
        Self {
            arms: HashMap::new(),
            default: None,
            closed: false,
        }
    }

    pub fn register(&mut self, payload_type: u8, handler: Box<dyn RtpHandler>) {
        self.arms.insert(payload_type, handler);
    }

    pub fn set_default(&mut self, handler: Box<dyn RtpHandler>) {
        self.default = Some(handler);
    }
}

impl Default for Mux {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RtpHandler for Mux {
    async fn handle_rtp(&mut self, header: &RtpHeader, payload: &[u8]) -> Result<()> {
        match self.arms.get_mut(&header.payload_type) {
            Some(handler) => handler.handle_rtp(header, payload).await,
            None => match &mut self.default {
                Some(handler) => handler.handle_rtp(header, payload).await,
                None => Ok(()),
            },
        }
    }

    fn pipeline(&self) -> String {
        let mut arms: Vec<String> = self
            .arms
            .iter()
            .map(|(pt, handler)| format!("{pt}:{}", handler.pipeline()))
            .collect();
        arms.sort();
        format!("mux[{}]", arms.join(","))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for handler in self.arms.values_mut() {
            handler.close().await;
        }
        if let Some(handler) = &mut self.default {
            handler.close().await;
        }
    }
}

/// Sink arm that counts and drops. Used as the mux default so unknown
/// payload types still show up in the packet statistics.
pub struct DropHandler {
    stats: Arc<PortStats>,
}

impl DropHandler {
    pub fn new(stats: Arc<PortStats>) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl RtpHandler for DropHandler {
    async fn handle_rtp(&mut self, _header: &RtpHeader, _payload: &[u8]) -> Result<()> {
        self.stats.ignored_packets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn pipeline(&self) -> String {
        "drop".to_string()
    }

    async fn close(&mut self) {}
}

/// Which (packets, bytes) counter pair of `PortStats` an arm updates.
#[derive(Debug, Clone, Copy)]
pub enum CounterKind {
    Mux,
    Audio,
    Dtmf,
}

impl CounterKind {
    fn counters<'a>(&self, stats: &'a PortStats) -> (&'a AtomicU64, &'a AtomicU64) {
        match self {
            CounterKind::Mux => (&stats.mux_packets, &stats.mux_bytes),
            CounterKind::Audio => (&stats.audio_packets, &stats.audio_bytes),
            CounterKind::Dtmf => (&stats.dtmf_packets, &stats.dtmf_bytes),
        }
    }
}

/// Wraps a handler and counts every packet and payload byte that passes
/// through, before the inner handler runs.
pub struct CountingHandler {
    inner: Box<dyn RtpHandler>,
    stats: Arc<PortStats>,
    kind: CounterKind,
}

impl CountingHandler {
    pub fn new(inner: Box<dyn RtpHandler>, stats: Arc<PortStats>, kind: CounterKind) -> Self {
        Self { inner, stats, kind }
    }
}

#[async_trait]
impl RtpHandler for CountingHandler {
    async fn handle_rtp(&mut self, header: &RtpHeader, payload: &[u8]) -> Result<()> {
        let (packets, bytes) = self.kind.counters(&self.stats);
        packets.fetch_add(1, Ordering::Relaxed);
        bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
        self.inner.handle_rtp(header, payload).await
    }

    fn pipeline(&self) -> String {
        self.inner.pipeline()
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::Error;

    /// Records every payload it sees; shared with the asserting test.
    pub(crate) struct Recorder {
        pub seen: Arc<Mutex<Vec<Vec<u8>>>>,
        pub fail: bool,
    }

    #[async_trait]
    impl RtpHandler for Recorder {
        async fn handle_rtp(&mut self, _header: &RtpHeader, payload: &[u8]) -> Result<()> {
            self.seen.lock().unwrap().push(payload.to_vec());
            if self.fail {
                return Err(Error::decode("recorder failure"));
            }
            Ok(())
        }

        fn pipeline(&self) -> String {
            "recorder".to_string()
        }

        async fn close(&mut self) {}
    }

    pub(crate) fn header(payload_type: u8) -> RtpHeader {
        RtpHeader {
            marker: false,
            payload_type,
            sequence_number: 1,
            timestamp: 0,
            ssrc: 0,
        }
    }

    #[tokio::test]
    async fn routes_by_payload_type() {
        let audio_seen = Arc::new(Mutex::new(Vec::new()));
        let stats = Arc::new(PortStats::default());
        let mut mux = Mux::new();
        mux.register(
            0,
            Box::new(Recorder {
                seen: audio_seen.clone(),
                fail: false,
            }),
        );
        mux.set_default(Box::new(DropHandler::new(stats.clone())));

        mux.handle_rtp(&header(0), &[1, 2]).await.unwrap();
        mux.handle_rtp(&header(96), &[3]).await.unwrap();

        assert_eq!(audio_seen.lock().unwrap().len(), 1);
        assert_eq!(stats.ignored_packets.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn counting_handler_tracks_packets_and_bytes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stats = Arc::new(PortStats::default());
        let mut counted = CountingHandler::new(
            Box::new(Recorder {
                seen,
                fail: false,
            }),
            stats.clone(),
            CounterKind::Audio,
        );

        counted.handle_rtp(&header(0), &[0u8; 160]).await.unwrap();
        counted.handle_rtp(&header(0), &[0u8; 160]).await.unwrap();

        assert_eq!(stats.audio_packets.load(Ordering::Relaxed), 2);
        assert_eq!(stats.audio_bytes.load(Ordering::Relaxed), 320);
    }
}
