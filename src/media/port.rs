use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Instant;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::audio::{MixInput, Mixer, PcmProcessor, PcmWriter, SwitchWriter};
use crate::config::MediaOptions;
use crate::dtmf::{self, DtmfCallback, DtmfDecoder};
use crate::error::{Error, Result};
use crate::net;
use crate::rtp::channel::UdpChannel;
use crate::rtp::jitter::JitterHandler;
use crate::rtp::mux::{CounterKind, CountingHandler, DropHandler, Mux};
use crate::rtp::seq::{RtpStream, SeqWriter};
use crate::rtp::session::{ReadStream, RtpSession};
use crate::rtp::{RtpHandler, MTU_SIZE};
use crate::sdp::{Answer, Encryption, MediaConfig, Offer};
use crate::srtp::SrtpSession;
use crate::stats::PortStats;

/// Consecutive handler failures before a stream is declared dead; one
/// second of bad 20 ms frames.
const MAX_ERRORS: u32 = 50;

/// Negotiated configuration plus local pipeline hooks, as applied by
/// `set_config`.
#[derive(Clone)]
pub struct MediaConf {
    pub config: MediaConfig,
    /// Wrapper applied to inbound PCM sinks installed via
    /// `write_audio_to`.
    pub processor: Option<PcmProcessor>,
}

impl From<MediaConfig> for MediaConf {
    fn from(config: MediaConfig) -> Self {
        Self {
            config,
            processor: None,
        }
    }
}

impl std::fmt::Debug for MediaConf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaConf")
            .field("config", &self.config)
            .field("processor", &self.processor.is_some())
            .finish()
    }
}

type HandlerRef = Arc<Mutex<Box<dyn RtpHandler>>>;

/// Media endpoint of one call leg: negotiates parameters via SDP,
/// terminates RTP/SRTP on a UDP port, decodes inbound audio and DTMF into
/// PCM, encodes outbound PCM, and enforces a media-inactivity timeout.
///
/// Cheap to clone; all clones drive the same port. The built-in codecs run
/// at 8 kHz, so the port sample rate must be 8000 unless external codecs
/// resample.
#[derive(Clone)]
pub struct MediaPort {
    inner: Arc<PortInner>,
}

struct PortInner {
    opts: MediaOptions,
    external_ip: IpAddr,
    local_port: u16,
    channel: Arc<UdpChannel>,
    stats: Arc<PortStats>,
    packet_count: Arc<AtomicU64>,

    media_received: CancellationToken,
    media_timeout: CancellationToken,
    closed: CancellationToken,
    close_once: AtomicBool,
    timeout_reset: mpsc::Sender<()>,
    timeout_start: StdRwLock<Option<Instant>>,

    dtmf_audio_enabled: AtomicBool,
    jitter_enabled: bool,

    audio_out: Arc<SwitchWriter>,
    audio_in: Arc<SwitchWriter>,
    dtmf_in: Arc<StdRwLock<Option<DtmfCallback>>>,
    /// Published decode chain; the read loops load it without holding any
    /// other lock. `None` while unconfigured or torn down.
    handler: RwLock<Option<HandlerRef>>,

    /// Coarse rewiring lock; held across pipeline rebuilds only, never
    /// across socket I/O.
    state: Mutex<PipelineState>,
}

#[derive(Default)]
struct PipelineState {
    conf: Option<MediaConf>,
    sess: Option<Arc<RtpSession>>,
    audio_out_rtp: Option<RtpStream>,
    dtmf_out_rtp: Option<RtpStream>,
    dtmf_out_audio: Option<MixInput>,
    dtmf_mixer: Option<Mixer>,
}

impl MediaPort {
    /// Bind a media port from the configured range and start its timeout
    /// watchdog. Must be called within a tokio runtime.
    pub fn new(opts: MediaOptions, sample_rate: u32) -> Result<Self> {
        let opts = opts.normalized();
        let bind_ip = match opts.ip {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = net::bind_udp_port_range(bind_ip, opts.ports)?;
        let channel = Arc::new(UdpChannel::new(socket));
        let local_port = channel.local_port()?;
        let stats = opts.stats.clone().unwrap_or_default();
        let (timeout_reset, reset_rx) = mpsc::channel(1);

        let inner = Arc::new(PortInner {
            external_ip: opts.ip,
            jitter_enabled: opts.enable_jitter_buffer,
            opts,
            local_port,
            channel,
            stats,
            packet_count: Arc::new(AtomicU64::new(0)),
            media_received: CancellationToken::new(),
            media_timeout: CancellationToken::new(),
            closed: CancellationToken::new(),
            close_once: AtomicBool::new(false),
            timeout_reset,
            timeout_start: StdRwLock::new(None),
            dtmf_audio_enabled: AtomicBool::new(false),
            audio_out: SwitchWriter::new(sample_rate),
            audio_in: SwitchWriter::new(sample_rate),
            dtmf_in: Arc::new(StdRwLock::new(None)),
            handler: RwLock::new(None),
            state: Mutex::new(PipelineState::default()),
        });
        tokio::spawn(timeout_loop(inner.clone(), reset_rx));
        tracing::debug!(port = local_port, "listening for media on UDP");
        Ok(Self { inner })
    }

    pub fn port(&self) -> u16 {
        self.inner.local_port
    }

    /// Latch fired once, on the first accepted inbound stream.
    pub fn received(&self) -> CancellationToken {
        self.inner.media_received.clone()
    }

    /// Latch fired once by the inactivity watchdog.
    pub fn timeout(&self) -> CancellationToken {
        self.inner.media_timeout.clone()
    }

    pub fn stats(&self) -> Arc<PortStats> {
        self.inner.stats.clone()
    }

    pub async fn config(&self) -> Option<MediaConf> {
        self.inner.state.lock().await.conf.clone()
    }

    /// Generate an SDP offer announcing the external address and port.
    pub fn new_offer(&self, enc: Encryption) -> Result<Offer> {
        Offer::new(self.inner.external_ip, self.inner.local_port, enc)
    }

    /// Decode and apply a peer answer to our offer. The returned
    /// configuration is inert until `set_config`.
    pub fn set_answer(&self, offer: &Offer, answer: &[u8], enc: Encryption) -> Result<MediaConf> {
        let answer = Answer::parse(answer)?;
        Ok(answer.apply(offer, enc)?.into())
    }

    /// Decode a peer offer and produce our answer. The returned
    /// configuration is inert until `set_config`.
    pub fn set_offer(&self, offer: &[u8], enc: Encryption) -> Result<(Answer, MediaConf)> {
        let offer = Offer::parse(offer)?;
        let (answer, config) = offer.answer(self.inner.external_ip, self.inner.local_port, enc)?;
        Ok((answer, config.into()))
    }

    /// Activate a negotiated configuration: publish the destination,
    /// create the (S)RTP session, and rebuild both pipeline directions.
    /// Replaces and closes any previously active session. Must not overlap
    /// with itself or with `close`.
    pub async fn set_config(&self, conf: &MediaConf) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.is_cancelled() {
            return Err(Error::AlreadyClosed);
        }
        let config = &conf.config;
        tracing::info!(
            audio_codec = config.codec.info().sdp_name,
            audio_rtp = config.audio_type,
            dtmf_rtp = config.dtmf_type,
            srtp = config
                .crypto
                .as_ref()
                .map(|c| c.profile.sdp_name())
                .unwrap_or("none"),
            "using codecs"
        );

        inner.channel.set_dst(config.remote).await;
        let srtp = match config.crypto.as_ref() {
            Some(crypto) => Some(SrtpSession::new(crypto)?),
            None => None,
        };
        let sess = RtpSession::new(inner.channel.clone(), srtp, inner.stats.clone());

        let mut state = inner.state.lock().await;
        if inner.closed.is_cancelled() {
            sess.close();
            return Err(Error::AlreadyClosed);
        }
        if let Some(old) = state.sess.take() {
            old.close();
        }
        if let Some(old) = state.dtmf_mixer.take() {
            let _ = old.close().await;
        }
        state.conf = Some(conf.clone());
        state.sess = Some(sess.clone());

        self.setup_output(&mut state, &sess, config).await?;
        self.setup_input(config).await;
        Ok(())
    }

    /// Build the encoding pipeline (PCM → RTP) and start accepting
    /// inbound streams. Called holding the state lock.
    async fn setup_output(
        &self,
        state: &mut PipelineState,
        sess: &Arc<RtpSession>,
        config: &MediaConfig,
    ) -> Result<()> {
        tokio::spawn(accept_loop(self.inner.clone(), sess.clone()));

        let seq = SeqWriter::new(sess.open_write_stream());
        let audio_stream = seq.new_stream(config.audio_type, config.codec.info().rtp_clock_rate);
        state.audio_out_rtp = Some(audio_stream.clone());

        let mut encoder: Box<dyn PcmWriter> = config.codec.encode_rtp(audio_stream);
        state.dtmf_out_rtp = None;
        state.dtmf_out_audio = None;
        if config.dtmf_type != 0 {
            state.dtmf_out_rtp = Some(seq.new_stream(config.dtmf_type, dtmf::SAMPLE_RATE));
            if self.inner.dtmf_audio_enabled.load(Ordering::Acquire) {
                // Separate mixer so tones can be spliced into live audio.
                let mixer = Mixer::new(encoder, config.codec.info().frame_dur);
                encoder = Box::new(mixer.new_input());
                state.dtmf_out_audio = Some(mixer.new_input());
                state.dtmf_mixer = Some(mixer);
            }
        }

        if let Some(prev) = self.inner.audio_out.swap(Some(encoder)).await? {
            let _ = prev.close().await;
        }
        Ok(())
    }

    /// Build and publish the decoding pipeline (RTP → PCM).
    async fn setup_input(&self, config: &MediaConfig) {
        let inner = &self.inner;
        let decoder = config
            .codec
            .decode_rtp(inner.audio_in.clone(), config.audio_type);

        let mut mux = Mux::new();
        mux.set_default(Box::new(DropHandler::new(inner.stats.clone())));
        mux.register(
            config.audio_type,
            Box::new(CountingHandler::new(
                decoder,
                inner.stats.clone(),
                CounterKind::Audio,
            )),
        );
        if config.dtmf_type != 0 {
            mux.register(
                config.dtmf_type,
                Box::new(CountingHandler::new(
                    Box::new(DtmfDecoder::new(inner.dtmf_in.clone())),
                    inner.stats.clone(),
                    CounterKind::Dtmf,
                )),
            );
        }

        let mut root: Box<dyn RtpHandler> = Box::new(CountingHandler::new(
            Box::new(mux),
            inner.stats.clone(),
            CounterKind::Mux,
        ));
        if inner.jitter_enabled {
            root = Box::new(JitterHandler::new(root));
        }
        *inner.handler.write().await = Some(Arc::new(Mutex::new(root)));
    }

    /// Install the sink receiving decoded inbound PCM, wrapped in the
    /// configured post-processor. The displaced sink is closed.
    pub async fn write_audio_to(&self, writer: Box<dyn PcmWriter>) -> Result<()> {
        let processor = {
            let state = self.inner.state.lock().await;
            state.conf.as_ref().and_then(|c| c.processor.clone())
        };
        let writer = match processor {
            Some(processor) => processor(writer),
            None => writer,
        };
        if let Some(prev) = self.inner.audio_in.swap(Some(writer)).await? {
            let _ = prev.close().await;
        }
        Ok(())
    }

    /// Outbound PCM entry point; frames written here are encoded onto the
    /// wire.
    pub fn audio_writer(&self) -> Arc<SwitchWriter> {
        self.inner.audio_out.clone()
    }

    pub fn disable_out(&self) {
        self.inner.audio_out.disable();
    }

    pub fn enable_out(&self) {
        self.inner.audio_out.enable();
    }

    /// Install or clear the inbound DTMF callback.
    pub fn handle_dtmf(&self, callback: Option<DtmfCallback>) {
        *self.inner.dtmf_in.write().unwrap() = callback;
    }

    /// Also synthesize audible tones for outbound DTMF. Takes effect at
    /// the next `set_config`.
    pub fn set_dtmf_audio(&self, enabled: bool) {
        self.inner.dtmf_audio_enabled.store(enabled, Ordering::Release);
    }

    /// Send a digit string as RFC 4733 events (and tones when enabled),
    /// aligned to the outbound audio timestamp. A no-op without an active
    /// DTMF stream.
    pub async fn write_dtmf(&self, cancel: &CancellationToken, digits: &str) -> Result<()> {
        if digits.is_empty() {
            return Ok(());
        }
        let (dtmf_rtp, dtmf_audio, audio_rtp) = {
            let state = self.inner.state.lock().await;
            (
                state.dtmf_out_rtp.clone(),
                state.dtmf_out_audio.clone(),
                state.audio_out_rtp.clone(),
            )
        };
        let dtmf_audio = if self.inner.dtmf_audio_enabled.load(Ordering::Acquire) {
            dtmf_audio
        } else {
            None
        };
        if dtmf_rtp.is_none() && dtmf_audio.is_none() {
            return Ok(());
        }
        let start_ts = audio_rtp
            .map(|stream| stream.current_timestamp())
            .unwrap_or(0);
        dtmf::write(
            cancel,
            dtmf_audio.as_ref().map(|w| w as &dyn PcmWriter),
            dtmf_rtp.as_ref(),
            start_ts,
            digits,
        )
        .await
    }

    /// Arm or disarm the inactivity watchdog.
    pub fn enable_timeout(&self, enabled: bool) {
        if !enabled {
            *self.inner.timeout_start.write().unwrap() = None;
            return;
        }
        let _ = self.inner.timeout_reset.try_send(());
        *self.inner.timeout_start.write().unwrap() = Some(Instant::now());
        tracing::info!(
            packets = self.inner.packet_count.load(Ordering::Relaxed),
            "media timeout enabled"
        );
    }

    /// Tear everything down: audio sinks, RTP session, decode chain, and
    /// the watchdog. Idempotent; swallows internal errors.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.close_once.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = inner.state.lock().await;
        if let Some(writer) = inner.audio_out.swap(None).await.ok().flatten() {
            let _ = writer.close().await;
        }
        let _ = inner.audio_out.close().await;
        if let Some(writer) = inner.audio_in.swap(None).await.ok().flatten() {
            let _ = writer.close().await;
        }
        let _ = inner.audio_in.close().await;
        state.audio_out_rtp = None;
        state.dtmf_out_rtp = None;
        state.dtmf_out_audio = None;
        if let Some(mixer) = state.dtmf_mixer.take() {
            let _ = mixer.close().await;
        }
        *inner.dtmf_in.write().unwrap() = None;
        if let Some(sess) = state.sess.take() {
            sess.close();
        }
        let handler = inner.handler.write().await.take();
        if let Some(handler) = handler {
            handler.lock().await.close().await;
        }
        inner.closed.cancel();
    }
}

/// Accept every inbound SSRC and spawn one read loop per stream. The
/// first accept breaks the media-received latch. Exits silently when the
/// session closes.
async fn accept_loop(inner: Arc<PortInner>, sess: Arc<RtpSession>) {
    loop {
        match sess.accept_stream().await {
            Ok((stream, ssrc)) => {
                inner.stats.streams.fetch_add(1, Ordering::Relaxed);
                inner.media_received.cancel();
                tracing::info!(ssrc, "accepting RTP stream");
                tokio::spawn(read_loop(inner.clone(), stream));
            }
            Err(_) => return,
        }
    }
}

async fn read_loop(inner: Arc<PortInner>, mut stream: ReadStream) {
    let ssrc = stream.ssrc();
    let mut overflow_logged = false;
    let mut error_count = 0u32;
    let mut pipeline = String::new();
    while let Some(packet) = stream.read().await {
        inner.packet_count.fetch_add(1, Ordering::Relaxed);
        inner.stats.packets.fetch_add(1, Ordering::Relaxed);
        if packet.wire_len > MTU_SIZE {
            // Log once per stream, drop always.
            if !overflow_logged {
                tracing::warn!(
                    ssrc,
                    size = packet.wire_len,
                    "RTP packet larger than MTU limit"
                );
                overflow_logged = true;
            }
            inner.stats.ignored_packets.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let handler = inner.handler.read().await.clone();
        let Some(handler) = handler else {
            inner.stats.ignored_packets.fetch_add(1, Ordering::Relaxed);
            continue;
        };
        inner.stats.input_packets.fetch_add(1, Ordering::Relaxed);
        let mut guard = handler.lock().await;
        match guard.handle_rtp(&packet.header, &packet.payload).await {
            Ok(()) => {
                error_count = 0;
                pipeline.clear();
            }
            Err(err) => {
                if pipeline.is_empty() {
                    pipeline = guard.pipeline();
                }
                tracing::debug!(
                    ssrc,
                    error = %err,
                    %pipeline,
                    error_count,
                    seq = packet.header.sequence_number,
                    payload_type = packet.header.payload_type,
                    payload_size = packet.payload.len(),
                    "RTP handler failed"
                );
                error_count += 1;
                if error_count >= MAX_ERRORS {
                    tracing::error!(
                        ssrc,
                        %pipeline,
                        "stopping RTP read loop after persistent decode errors"
                    );
                    return;
                }
            }
        }
    }
}

/// Inactivity watchdog: samples the packet counter once per steady-state
/// interval. A longer initial grace tolerates slow-start peers; after any
/// packet, silence for a full interval fires the one-shot timeout.
async fn timeout_loop(inner: Arc<PortInner>, mut reset_rx: mpsc::Receiver<()>) {
    let tick = inner.opts.media_timeout;
    let new_ticker = || {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    };
    let mut ticker = new_ticker();
    let mut last_packets = 0u64;
    let mut start_packets = 0u64;
    let mut last_time = Instant::now();
    loop {
        tokio::select! {
            _ = inner.closed.cancelled() => return,
            _ = reset_rx.recv() => {
                ticker = new_ticker();
                start_packets = inner.packet_count.load(Ordering::Relaxed);
                last_time = Instant::now();
            }
            _ = ticker.tick() => {
                let current = inner.packet_count.load(Ordering::Relaxed);
                if current != last_packets {
                    last_packets = current;
                    last_time = Instant::now();
                    continue; // wait for the next tick
                }
                let started = *inner.timeout_start.read().unwrap();
                let Some(started) = started else {
                    continue; // timeout disabled
                };
                // The first window may be longer; skip ticks until the
                // initial grace has passed without any packet.
                let since_start = started.elapsed();
                if last_packets == start_packets && since_start < inner.opts.media_timeout_initial {
                    continue;
                }
                // The ticker may fire early relative to the last packet.
                let since_last = last_time.elapsed();
                if since_last < inner.opts.media_timeout {
                    continue;
                }
                tracing::info!(
                    packets = last_packets,
                    start_packets,
                    ?since_start,
                    ?since_last,
                    "triggering media timeout"
                );
                inner.media_timeout.cancel();
                return;
            }
        }
    }
}
