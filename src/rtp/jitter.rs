use async_trait::async_trait;
use bytes::Bytes;

use super::{RtpHandler, RtpHeader};
use crate::error::Result;

/// Packets held before a gap is declared lost. At 20 ms frames this is
/// roughly a 60 ms reorder window.
const DEFAULT_DEPTH: usize = 3;

/// Upper bound on buffered packets regardless of gaps.
const MAX_BUFFERED: usize = 16;

/// Reorder adapter around the mux root. Packets are released to the inner
/// handler in sequence order; a missing packet is waited for until the
/// buffer grows past the configured depth, then the gap is skipped. Late
/// arrivals for already-released sequence numbers are dropped.
pub struct JitterHandler {
    inner: Box<dyn RtpHandler>,
    depth: usize,
    pending: Vec<(RtpHeader, Bytes)>,
    next_seq: Option<u16>,
}

impl JitterHandler {
    pub fn new(inner: Box<dyn RtpHandler>) -> Self {
        Self::with_depth(inner, DEFAULT_DEPTH)
    }

    pub fn with_depth(inner: Box<dyn RtpHandler>, depth: usize) -> Self {
        Self {
            inner,
            depth: depth.min(MAX_BUFFERED),
            pending: Vec::new(),
            next_seq: None,
        }
    }

    fn insert(&mut self, header: RtpHeader, payload: Bytes) {
        let seq = header.sequence_number;
        if self
            .pending
            .iter()
            .any(|(h, _)| h.sequence_number == seq)
        {
            return; // duplicate
        }
        let pos = self
            .pending
            .partition_point(|(h, _)| seq_before(h.sequence_number, seq));
        self.pending.insert(pos, (header, payload));
    }

    async fn drain_ready(&mut self) -> Result<()> {
        let mut result = Ok(());
        while !self.pending.is_empty() {
            let front_seq = self.pending[0].0.sequence_number;
            let (release, skips_gap) = match self.next_seq {
                None => (true, false),
                Some(next) if front_seq == next => (true, false),
                Some(_) => (self.pending.len() > self.depth, true),
            };
            if !release {
                break;
            }
            let (header, payload) = self.pending.remove(0);
            if skips_gap {
                tracing::debug!(seq = front_seq, "jitter buffer skipped a gap");
            }
            self.next_seq = Some(header.sequence_number.wrapping_add(1));
            if let Err(err) = self.inner.handle_rtp(&header, &payload).await {
                // Keep draining so one bad frame does not stall the buffer,
                // but surface the error to the read loop's counter.
                result = Err(err);
            }
        }
        result
    }
}

#[async_trait]
impl RtpHandler for JitterHandler {
    async fn handle_rtp(&mut self, header: &RtpHeader, payload: &[u8]) -> Result<()> {
        if let Some(next) = self.next_seq {
            if seq_before(header.sequence_number, next) {
                tracing::debug!(
                    seq = header.sequence_number,
                    expected = next,
                    "dropping late RTP packet"
                );
                return Ok(());
            }
        }
        self.insert(header.clone(), Bytes::copy_from_slice(payload));
        self.drain_ready().await
    }

    fn pipeline(&self) -> String {
        format!("jitter({})", self.inner.pipeline())
    }

    async fn close(&mut self) {
        self.pending.clear();
        self.inner.close().await;
    }
}

/// Wrapping comparison: does `a` come strictly before `b` in u16 sequence
/// space?
fn seq_before(a: u16, b: u16) -> bool {
    a != b && b.wrapping_sub(a) < 0x8000
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::super::mux::tests::{header, Recorder};
    use super::*;

    fn ordered_header(seq: u16) -> RtpHeader {
        let mut h = header(0);
        h.sequence_number = seq;
        h
    }

    #[tokio::test]
    async fn reorders_out_of_order_packets() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut jitter = JitterHandler::new(Box::new(Recorder {
            seen: seen.clone(),
            fail: false,
        }));

        jitter.handle_rtp(&ordered_header(1), &[1]).await.unwrap();
        jitter.handle_rtp(&ordered_header(3), &[3]).await.unwrap();
        jitter.handle_rtp(&ordered_header(2), &[2]).await.unwrap();
        jitter.handle_rtp(&ordered_header(4), &[4]).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![vec![1], vec![2], vec![3], vec![4]]);
    }

    #[tokio::test]
    async fn skips_gap_when_buffer_fills() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut jitter = JitterHandler::with_depth(
            Box::new(Recorder {
                seen: seen.clone(),
                fail: false,
            }),
            2,
        );

        jitter.handle_rtp(&ordered_header(1), &[1]).await.unwrap();
        // Packet 2 never arrives.
        jitter.handle_rtp(&ordered_header(3), &[3]).await.unwrap();
        jitter.handle_rtp(&ordered_header(4), &[4]).await.unwrap();
        jitter.handle_rtp(&ordered_header(5), &[5]).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![vec![1], vec![3], vec![4], vec![5]]);
    }

    #[tokio::test]
    async fn drops_late_packets() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut jitter = JitterHandler::new(Box::new(Recorder {
            seen: seen.clone(),
            fail: false,
        }));

        jitter.handle_rtp(&ordered_header(10), &[10]).await.unwrap();
        jitter.handle_rtp(&ordered_header(9), &[9]).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![vec![10]]);
    }
}
