pub mod g711;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Wraps a PCM sink, e.g. to apply noise suppression before it reaches the
/// room fabric.
pub type PcmProcessor = Arc<dyn Fn(Box<dyn PcmWriter>) -> Box<dyn PcmWriter> + Send + Sync>;

/// Sink for 16-bit linear PCM frames at a fixed sample rate.
#[async_trait]
pub trait PcmWriter: Send + Sync {
    fn sample_rate(&self) -> u32;

    async fn write(&self, frame: &[i16]) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Hot-swappable PCM sink. The current target can be replaced while
/// packets are in flight; the displaced writer is handed back to the
/// caller for closing. A disabled switch drops writes silently.
pub struct SwitchWriter {
    sample_rate: u32,
    slot: Mutex<Slot>,
    enabled: AtomicBool,
}

struct Slot {
    target: Option<Box<dyn PcmWriter>>,
    closed: bool,
}

impl SwitchWriter {
    pub fn new(sample_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            sample_rate,
            slot: Mutex::new(Slot {
                target: None,
                closed: false,
            }),
            enabled: AtomicBool::new(true),
        })
    }

    /// Replace the target, returning the displaced writer. All parties
    /// must share the switch sample rate.
    pub async fn swap(
        &self,
        new: Option<Box<dyn PcmWriter>>,
    ) -> Result<Option<Box<dyn PcmWriter>>> {
        if let Some(writer) = &new {
            if writer.sample_rate() != self.sample_rate {
                return Err(Error::rejected(format!(
                    "sample rate mismatch: switch {} Hz, writer {} Hz",
                    self.sample_rate,
                    writer.sample_rate()
                )));
            }
        }
        let mut slot = self.slot.lock().await;
        if slot.closed {
            return Err(Error::AlreadyClosed);
        }
        Ok(std::mem::replace(&mut slot.target, new))
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }
}

#[async_trait]
impl PcmWriter for SwitchWriter {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn write(&self, frame: &[i16]) -> Result<()> {
        if !self.enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        let slot = self.slot.lock().await;
        match &slot.target {
            Some(writer) if !slot.closed => writer.write(frame).await,
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        slot.closed = true;
        match slot.target.take() {
            Some(writer) => writer.close().await,
            None => Ok(()),
        }
    }
}

/// Additive mixer feeding one PCM sink from several inputs, used to
/// splice DTMF tones into outbound audio. A mix task emits one frame per
/// packetization interval whenever any input has queued samples; inputs
/// missing samples contribute silence.
pub struct Mixer {
    shared: Arc<MixerShared>,
    shutdown: CancellationToken,
}

struct MixerShared {
    sample_rate: u32,
    frame_samples: usize,
    out: Mutex<Box<dyn PcmWriter>>,
    queues: std::sync::Mutex<Vec<VecDeque<i16>>>,
}

impl Mixer {
    pub fn new(out: Box<dyn PcmWriter>, frame_dur: Duration) -> Self {
        let sample_rate = out.sample_rate();
        let frame_samples = (sample_rate as u128 * frame_dur.as_micros() / 1_000_000) as usize;
        let shared = Arc::new(MixerShared {
            sample_rate,
            frame_samples: frame_samples.max(1),
            out: Mutex::new(out),
            queues: std::sync::Mutex::new(Vec::new()),
        });
        let shutdown = CancellationToken::new();
        tokio::spawn(mix_loop(shared.clone(), frame_dur, shutdown.clone()));
        Self { shared, shutdown }
    }

    pub fn new_input(&self) -> MixInput {
        let index = {
            let mut queues = self.shared.queues.lock().unwrap();
            queues.push(VecDeque::new());
            queues.len() - 1
        };
        MixInput {
            shared: self.shared.clone(),
            index,
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.shared.out.lock().await.close().await
    }
}

async fn mix_loop(shared: Arc<MixerShared>, frame_dur: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(frame_dur);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let frame = {
            let mut queues = shared.queues.lock().unwrap();
            if queues.iter().all(|q| q.is_empty()) {
                continue;
            }
            let mut frame = vec![0i32; shared.frame_samples];
            for queue in queues.iter_mut() {
                for slot in frame.iter_mut() {
                    match queue.pop_front() {
                        Some(sample) => *slot += sample as i32,
                        None => break,
                    }
                }
            }
            frame
                .into_iter()
                .map(|s| s.clamp(i16::MIN as i32, i16::MAX as i32) as i16)
                .collect::<Vec<i16>>()
        };
        if let Err(err) = shared.out.lock().await.write(&frame).await {
            tracing::debug!(error = %err, "mixer output write failed");
        }
    }
}

/// One mixer input; cheap to clone and safe to write from any task.
#[derive(Clone)]
pub struct MixInput {
    shared: Arc<MixerShared>,
    index: usize,
}

#[async_trait]
impl PcmWriter for MixInput {
    fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    async fn write(&self, frame: &[i16]) -> Result<()> {
        let mut queues = self.shared.queues.lock().unwrap();
        let queue = &mut queues[self.index];
        // Bound the backlog to a second of audio so a stalled mix task
        // cannot grow the queue without limit.
        let cap = self.shared.sample_rate as usize;
        if queue.len() + frame.len() > cap {
            return Ok(());
        }
        queue.extend(frame.iter().copied());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shared.queues.lock().unwrap()[self.index].clear();
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;

    /// Test sink capturing every sample it receives.
    pub(crate) struct Capture {
        pub rate: u32,
        pub samples: Arc<StdMutex<Vec<i16>>>,
        pub closes: Arc<StdMutex<usize>>,
    }

    impl Capture {
        pub(crate) fn new(rate: u32) -> (Box<dyn PcmWriter>, Arc<StdMutex<Vec<i16>>>, Arc<StdMutex<usize>>) {
            let samples = Arc::new(StdMutex::new(Vec::new()));
            let closes = Arc::new(StdMutex::new(0));
            (
                Box::new(Capture {
                    rate,
                    samples: samples.clone(),
                    closes: closes.clone(),
                }),
                samples,
                closes,
            )
        }
    }

    #[async_trait]
    impl PcmWriter for Capture {
        fn sample_rate(&self) -> u32 {
            self.rate
        }

        async fn write(&self, frame: &[i16]) -> Result<()> {
            self.samples.lock().unwrap().extend_from_slice(frame);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            *self.closes.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn swap_returns_displaced_writer() {
        let switch = SwitchWriter::new(8000);
        let (first, first_samples, _) = Capture::new(8000);
        let (second, second_samples, _) = Capture::new(8000);

        assert!(switch.swap(Some(first)).await.unwrap().is_none());
        switch.write(&[1, 2]).await.unwrap();

        let displaced = switch.swap(Some(second)).await.unwrap().unwrap();
        displaced.close().await.unwrap();
        switch.write(&[3]).await.unwrap();

        assert_eq!(*first_samples.lock().unwrap(), vec![1, 2]);
        assert_eq!(*second_samples.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn rejects_sample_rate_mismatch() {
        let switch = SwitchWriter::new(8000);
        let (writer, _, _) = Capture::new(16000);
        assert!(matches!(
            switch.swap(Some(writer)).await,
            Err(Error::ConfigRejected(_))
        ));
    }

    #[tokio::test]
    async fn disabled_switch_drops_writes() {
        let switch = SwitchWriter::new(8000);
        let (writer, samples, _) = Capture::new(8000);
        switch.swap(Some(writer)).await.unwrap();

        switch.disable();
        switch.write(&[5; 10]).await.unwrap();
        assert!(samples.lock().unwrap().is_empty());

        switch.enable();
        switch.write(&[5; 10]).await.unwrap();
        assert_eq!(samples.lock().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn close_is_terminal_and_closes_target_once() {
        let switch = SwitchWriter::new(8000);
        let (writer, _, closes) = Capture::new(8000);
        switch.swap(Some(writer)).await.unwrap();

        switch.close().await.unwrap();
        switch.close().await.unwrap();
        assert_eq!(*closes.lock().unwrap(), 1);

        // Drained: writes disappear, swaps fail.
        switch.write(&[1]).await.unwrap();
        let (other, _, _) = Capture::new(8000);
        assert!(matches!(
            switch.swap(Some(other)).await,
            Err(Error::AlreadyClosed)
        ));
    }

    #[tokio::test]
    async fn mixer_sums_concurrent_inputs() {
        let (out, samples, _) = Capture::new(8000);
        let mixer = Mixer::new(out, Duration::from_millis(20));
        let a = mixer.new_input();
        let b = mixer.new_input();

        a.write(&[1000; 160]).await.unwrap();
        b.write(&[2000; 160]).await.unwrap();

        let mut mixed = Vec::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            mixed = samples.lock().unwrap().clone();
            if mixed.len() >= 160 {
                break;
            }
        }
        assert!(mixed.len() >= 160, "mixer produced no frame");
        assert!(mixed[..160].iter().all(|&s| s == 3000));

        mixer.close().await.unwrap();
    }
}
