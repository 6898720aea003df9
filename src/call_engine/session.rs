//! Media Session - bidirektionaler Audio-Fluss über UDP
//!
//! Zwei Threads teilen sich den UDP-Socket:
//! - Capture: Mikrofon → Gain → Denoiser → VAD → Encoder → `send_to`
//! - Playback: `recv_from` (60ms Timeout) → Decoder/Concealment → Lautsprecher
//!
//! Jeder Flow besitzt sein Gerät und seinen Codec exklusiv; geteilt werden
//! nur Socket, Statistik und das Cancellation-Token.

use super::audio::{AudioBackend, AudioError, AudioSink, AudioSource};
use super::codec::{CodecError, CodecFactory, VoiceDecoder, VoiceEncoder};
use super::denoise::Denoiser;
use super::stats::{StatsSnapshot, TrafficStats};
use super::vad::{apply_gain, VoiceActivityDetector};
use super::{Frame, FRAME_SIZE};
use crate::config::MediaConfig;
use crate::rendezvous::{PeerAddress, RendezvousOutcome};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Empfangspuffer für ein Datagramm
const RECEIVE_BUFFER_SIZE: usize = 8192;

type FlowHandle = JoinHandle<Result<(), MediaError>>;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Socket error: {0}")]
    Socket(#[from] io::Error),

    #[error("Failed to spawn {0} thread: {1}")]
    Spawn(&'static str, #[source] io::Error),

    #[error("{0} flow panicked")]
    Panicked(&'static str),
}

// ============================================================================
// MEDIA SESSION
// ============================================================================

pub struct MediaSession {
    socket: Arc<UdpSocket>,
    peer: PeerAddress,
    relay: bool,
    config: MediaConfig,
    stats: Arc<TrafficStats>,
}

impl MediaSession {
    /// Übernimmt Socket und Peer-Adresse aus dem Rendezvous
    pub fn new(outcome: RendezvousOutcome, config: MediaConfig) -> Result<Self, MediaError> {
        let RendezvousOutcome {
            socket,
            peer_address,
            relay,
        } = outcome;

        socket.set_nonblocking(false)?;
        // Nur der Playback-Flow liest; ein Timeout von 0 wäre "kein Timeout"
        socket.set_read_timeout(Some(config.receive_timeout().max(Duration::from_millis(1))))?;

        Ok(Self {
            socket: Arc::new(socket),
            peer: peer_address,
            relay,
            config,
            stats: Arc::new(TrafficStats::new()),
        })
    }

    pub fn peer(&self) -> PeerAddress {
        self.peer
    }

    pub fn relay(&self) -> bool {
        self.relay
    }

    /// Startet beide Flows
    ///
    /// Ein fataler Fehler in einem Flow bricht `cancel` ab, damit der andere
    /// Flow ebenfalls endet.
    pub fn start(
        self,
        backend: Arc<dyn AudioBackend>,
        codecs: Arc<dyn CodecFactory>,
        cancel: CancellationToken,
    ) -> Result<RunningSession, MediaError> {
        let peer = SocketAddr::from(self.peer);
        let vad = VoiceActivityDetector::new(self.config.silence_threshold_dbfs);
        let gain = self.config.input_gain;
        let denoise = self.config.denoise;

        tracing::info!(
            "Starting media session with {} ({})",
            self.peer,
            if self.relay { "relay" } else { "direct" }
        );

        let capture = {
            let flow = FlowContext::new(&self.socket, peer, &self.stats, &cancel);
            let backend = Arc::clone(&backend);
            let codecs = Arc::clone(&codecs);

            spawn_flow("capture", flow, move |ctx| {
                let mut source = backend.open_source()?;
                let mut encoder = codecs.encoder()?;
                let mut denoiser = denoise.then(Denoiser::new);

                let result = run_capture(
                    source.as_mut(),
                    encoder.as_mut(),
                    denoiser.as_mut(),
                    &vad,
                    gain,
                    ctx,
                );

                // Freigabe: erst Gerät, dann Codec
                drop(source);
                drop(denoiser);
                drop(encoder);
                result
            })?
        };

        let playback = {
            let flow = FlowContext::new(&self.socket, peer, &self.stats, &cancel);

            spawn_flow("playback", flow, move |ctx| {
                let mut sink = backend.open_sink()?;
                let mut decoder = codecs.decoder()?;

                let result = run_playback(sink.as_mut(), decoder.as_mut(), ctx);

                drop(sink);
                drop(decoder);
                result
            })
        };

        let playback = match playback {
            Ok(handle) => handle,
            Err(e) => {
                cancel.cancel();
                let _ = join_flow(capture, "capture");
                return Err(e);
            }
        };

        Ok(RunningSession {
            capture: Some(capture),
            playback: Some(playback),
            socket: Some(self.socket),
            stats: self.stats,
            cancel,
        })
    }
}

// ============================================================================
// RUNNING SESSION
// ============================================================================

/// Laufende Session; beim Drop werden beide Flows gestoppt und eingesammelt
pub struct RunningSession {
    capture: Option<FlowHandle>,
    playback: Option<FlowHandle>,
    socket: Option<Arc<UdpSocket>>,
    stats: Arc<TrafficStats>,
    cancel: CancellationToken,
}

impl RunningSession {
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Token, das beide Flows beendet (auch von den Flows selbst bei Fehlern gesetzt)
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ob mindestens ein Flow bereits beendet ist
    pub fn is_finished(&self) -> bool {
        let finished =
            |handle: &Option<FlowHandle>| handle.as_ref().map_or(true, |h| h.is_finished());
        finished(&self.capture) || finished(&self.playback)
    }

    /// Stoppt beide Flows, wartet auf sie und gibt danach den Socket frei
    pub fn shutdown(mut self) -> Result<StatsSnapshot, MediaError> {
        self.cancel.cancel();

        let capture = self.capture.take().map_or(Ok(()), |h| join_flow(h, "capture"));
        let playback = self.playback.take().map_or(Ok(()), |h| join_flow(h, "playback"));

        // Kein Flow lebt länger als der Socket
        self.socket.take();

        let stats = self.stats.snapshot();
        tracing::info!("Media session stopped: {:?}", stats);

        capture.and(playback).map(|_| stats)
    }
}

impl Drop for RunningSession {
    fn drop(&mut self) {
        if self.capture.is_none() && self.playback.is_none() {
            return;
        }

        self.cancel.cancel();
        if let Some(handle) = self.capture.take() {
            let _ = join_flow(handle, "capture");
        }
        if let Some(handle) = self.playback.take() {
            let _ = join_flow(handle, "playback");
        }
    }
}

// ============================================================================
// FLOWS
// ============================================================================

/// Was ein Flow mit der Außenwelt teilt
pub(crate) struct FlowContext {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    stats: Arc<TrafficStats>,
    cancel: CancellationToken,
}

impl FlowContext {
    pub(crate) fn new(
        socket: &Arc<UdpSocket>,
        peer: SocketAddr,
        stats: &Arc<TrafficStats>,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            socket: Arc::clone(socket),
            peer,
            stats: Arc::clone(stats),
            cancel: cancel.clone(),
        }
    }
}

fn spawn_flow<F>(
    name: &'static str,
    ctx: FlowContext,
    body: F,
) -> Result<FlowHandle, MediaError>
where
    F: FnOnce(&FlowContext) -> Result<(), MediaError> + Send + 'static,
{
    let span = tracing::Span::current();

    thread::Builder::new()
        .name(format!("voice-{}", name))
        .spawn(move || {
            let _entered = span.enter();
            tracing::debug!("{} flow started", name);

            let result = body(&ctx);
            match &result {
                Ok(()) => tracing::debug!("{} flow stopped", name),
                Err(e) => {
                    tracing::error!("{} flow failed: {}", name, e);
                    ctx.cancel.cancel();
                }
            }
            result
        })
        .map_err(|e| MediaError::Spawn(name, e))
}

fn join_flow(
    handle: FlowHandle,
    name: &'static str,
) -> Result<(), MediaError> {
    handle.join().map_err(|_| MediaError::Panicked(name))?
}

/// Mikrofon → Gain → Denoiser → VAD → Encoder → UDP
pub(crate) fn run_capture(
    source: &mut dyn AudioSource,
    encoder: &mut dyn VoiceEncoder,
    mut denoiser: Option<&mut Denoiser>,
    vad: &VoiceActivityDetector,
    gain: f32,
    ctx: &FlowContext,
) -> Result<(), MediaError> {
    let mut frame: Frame = [0.0; FRAME_SIZE];
    let mut filled = 0;

    while !ctx.cancel.is_cancelled() {
        filled += source.read(&mut frame[filled..])?;
        if filled < FRAME_SIZE {
            continue;
        }
        filled = 0;

        ctx.stats.frame_captured();
        apply_gain(&mut frame, gain);
        if let Some(denoiser) = denoiser.as_deref_mut() {
            denoiser.process(&mut frame);
        }

        if vad.is_silent(&frame) {
            ctx.stats.frame_suppressed();
            continue;
        }

        let packet = match encoder.encode(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("Dropping frame, encoding failed: {}", e);
                ctx.stats.codec_error();
                continue;
            }
        };

        match ctx.socket.send_to(&packet, ctx.peer) {
            Ok(sent) => {
                ctx.stats.packet_sent(sent);
                tracing::trace!("Sent {} bytes to {}", sent, ctx.peer);
            }
            Err(e) if is_transient(&e) => tracing::debug!("Send failed, skipping frame: {}", e),
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// UDP → Decoder (oder Concealment) → Lautsprecher
pub(crate) fn run_playback(
    sink: &mut dyn AudioSink,
    decoder: &mut dyn VoiceDecoder,
    ctx: &FlowContext,
) -> Result<(), MediaError> {
    let mut buffer = [0u8; RECEIVE_BUFFER_SIZE];
    let mut frame: Frame = [0.0; FRAME_SIZE];

    while !ctx.cancel.is_cancelled() {
        let received = match ctx.socket.recv_from(&mut buffer) {
            // Leere Datagramme (Registrierung/Keep-alive) tragen keine Nutzdaten
            Ok((0, _)) => None,
            Ok((size, from)) => {
                ctx.stats.packet_received(size);
                tracing::trace!("Received {} bytes from {}", size, from);
                Some(size)
            }
            Err(e) if is_transient(&e) => None,
            Err(e) => return Err(e.into()),
        };

        let decoded = match received {
            Some(size) => decoder.decode(Some(&buffer[..size]), &mut frame),
            None => decoder.decode(None, &mut frame),
        };

        if let Err(e) = decoded {
            tracing::warn!("Dropping frame, decoding failed: {}", e);
            ctx.stats.codec_error();
            continue;
        }
        if received.is_none() {
            ctx.stats.frame_concealed();
        }

        if !write_frame(sink, &frame, &ctx.cancel)? {
            break;
        }
        ctx.stats.frame_played();
    }

    Ok(())
}

/// Schreibt einen vollen Frame; `false` wenn vorher abgebrochen wurde
fn write_frame(
    sink: &mut dyn AudioSink,
    frame: &Frame,
    cancel: &CancellationToken,
) -> Result<bool, MediaError> {
    let mut written = 0;
    while written < FRAME_SIZE {
        if cancel.is_cancelled() {
            return Ok(false);
        }
        written += sink.write(&frame[written..])?;
    }
    Ok(true)
}

/// Timeouts und ICMP-bedingte Fehler sind normaler Betrieb, kein Abbruchgrund
fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
    )
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::testing::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    fn socket_pair() -> (Arc<UdpSocket>, UdpSocket) {
        let local = UdpSocket::bind("127.0.0.1:0").unwrap();
        let remote = UdpSocket::bind("127.0.0.1:0").unwrap();
        remote
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        (Arc::new(local), remote)
    }

    fn context(socket: &Arc<UdpSocket>, peer: SocketAddr, cancel: &CancellationToken) -> FlowContext {
        FlowContext::new(socket, peer, &Arc::new(TrafficStats::new()), cancel)
    }

    #[test]
    fn test_silent_frames_are_never_sent() {
        let (local, remote) = socket_pair();
        let cancel = CancellationToken::new();
        let ctx = context(&local, remote.local_addr().unwrap(), &cancel);

        let codec = PcmCodec::default();
        let mut encoder = codec.encoder().unwrap();
        let mut source =
            ScriptedSource::new(vec![0.0; FRAME_SIZE * 5], 700).cancel_when_done(cancel.clone());

        run_capture(
            &mut source,
            encoder.as_mut(),
            None,
            &VoiceActivityDetector::default(),
            1.0,
            &ctx,
        )
        .unwrap();

        let stats = ctx.stats.snapshot();
        assert_eq!(stats.frames_captured, 5);
        assert_eq!(stats.frames_suppressed, 5);
        assert_eq!(stats.packets_sent, 0);
        assert_eq!(codec.encoded.load(Ordering::SeqCst), 0);

        let mut buf = [0u8; 16];
        assert!(remote.recv_from(&mut buf).is_err());
    }

    #[test]
    fn test_active_frames_become_one_datagram_each() {
        let (local, remote) = socket_pair();
        let cancel = CancellationToken::new();
        let ctx = context(&local, remote.local_addr().unwrap(), &cancel);

        let mut samples = constant_frame(0.25);
        samples.extend(constant_frame(0.0));
        samples.extend(constant_frame(-0.5));

        let codec = PcmCodec::default();
        let mut encoder = codec.encoder().unwrap();
        let mut source = ScriptedSource::new(samples, 1000).cancel_when_done(cancel.clone());

        run_capture(
            &mut source,
            encoder.as_mut(),
            None,
            &VoiceActivityDetector::default(),
            1.0,
            &ctx,
        )
        .unwrap();

        let mut buf = [0u8; 8192];
        let mut expected = PcmCodec::default().encoder().unwrap();
        for amplitude in [0.25f32, -0.5] {
            let (size, from) = remote.recv_from(&mut buf).unwrap();
            assert_eq!(from, local.local_addr().unwrap());
            let frame: Frame = [amplitude; FRAME_SIZE];
            assert_eq!(&buf[..size], expected.encode(&frame).unwrap().as_slice());
        }
        assert!(remote.recv_from(&mut buf).is_err());

        let stats = ctx.stats.snapshot();
        assert_eq!(stats.packets_sent, 2);
        assert_eq!(stats.bytes_sent, 2 * FRAME_SIZE as u64 * 2);
        assert_eq!(stats.frames_suppressed, 1);
    }

    #[test]
    fn test_gain_lifts_quiet_frames_above_threshold() {
        let (local, remote) = socket_pair();
        let cancel = CancellationToken::new();
        let ctx = context(&local, remote.local_addr().unwrap(), &cancel);

        // -60 dBFS, mit Gain 100 -> -20 dBFS
        let codec = PcmCodec::default();
        let mut encoder = codec.encoder().unwrap();
        let mut source =
            ScriptedSource::new(constant_frame(0.001), FRAME_SIZE).cancel_when_done(cancel.clone());

        run_capture(
            &mut source,
            encoder.as_mut(),
            None,
            &VoiceActivityDetector::default(),
            100.0,
            &ctx,
        )
        .unwrap();

        assert_eq!(ctx.stats.snapshot().packets_sent, 1);
    }

    #[test]
    fn test_denoiser_runs_before_voice_detection() {
        // Weißes Rauschen um -45 dBFS liegt über der Schwelle, entrauscht darunter
        let mut seed = 11u32;
        let samples: Vec<f32> = (0..FRAME_SIZE * 20)
            .map(|_| {
                seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                ((seed >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0) * 0.01
            })
            .collect();

        let run = |denoiser: Option<&mut Denoiser>| {
            let (local, remote) = socket_pair();
            let cancel = CancellationToken::new();
            let ctx = context(&local, remote.local_addr().unwrap(), &cancel);
            let mut encoder = PcmCodec::default().encoder().unwrap();
            let mut source =
                ScriptedSource::new(samples.clone(), 4000).cancel_when_done(cancel.clone());

            run_capture(
                &mut source,
                encoder.as_mut(),
                denoiser,
                &VoiceActivityDetector::default(),
                1.0,
                &ctx,
            )
            .unwrap();
            ctx.stats.snapshot()
        };

        let plain = run(None);
        assert_eq!(plain.packets_sent, 20);

        let mut denoiser = Denoiser::new();
        let cleaned = run(Some(&mut denoiser));
        assert_eq!(cleaned.frames_captured, 20);
        assert!(cleaned.frames_suppressed > 0);
        assert!(cleaned.packets_sent < plain.packets_sent);
    }

    #[test]
    fn test_encode_failure_drops_only_that_frame() {
        let (local, remote) = socket_pair();
        let cancel = CancellationToken::new();
        let ctx = context(&local, remote.local_addr().unwrap(), &cancel);

        let codec = PcmCodec {
            fail_every: Some(2),
            ..PcmCodec::default()
        };
        let mut encoder = codec.encoder().unwrap();
        let samples: Vec<f32> = (0..4).flat_map(|_| constant_frame(0.5)).collect();
        let mut source = ScriptedSource::new(samples, 2000).cancel_when_done(cancel.clone());

        run_capture(
            &mut source,
            encoder.as_mut(),
            None,
            &VoiceActivityDetector::default(),
            1.0,
            &ctx,
        )
        .unwrap();

        let stats = ctx.stats.snapshot();
        assert_eq!(stats.packets_sent, 2);
        assert_eq!(stats.codec_errors, 2);
    }

    #[test]
    fn test_missing_datagrams_are_concealed() {
        let (local, remote) = socket_pair();
        local
            .set_read_timeout(Some(Duration::from_millis(5)))
            .unwrap();
        let cancel = CancellationToken::new();
        let ctx = context(&local, remote.local_addr().unwrap(), &cancel);

        let codec = PcmCodec::default();
        let mut decoder = codec.decoder().unwrap();
        let mut sink = RecordingSink::new().cancel_after(6, cancel.clone());
        let played = Arc::clone(&sink.samples);

        run_playback(&mut sink, decoder.as_mut(), &ctx).unwrap();

        assert_eq!(codec.concealed.load(Ordering::SeqCst), 6);
        assert_eq!(codec.decoded.load(Ordering::SeqCst), 0);
        assert_eq!(played.lock().len(), 6 * FRAME_SIZE);

        let stats = ctx.stats.snapshot();
        assert_eq!(stats.frames_concealed, 6);
        assert_eq!(stats.frames_played, 6);
    }

    #[test]
    fn test_received_packets_play_in_order() {
        let (local, remote) = socket_pair();
        local
            .set_read_timeout(Some(Duration::from_millis(5)))
            .unwrap();
        let cancel = CancellationToken::new();
        let ctx = context(&local, remote.local_addr().unwrap(), &cancel);

        let mut encoder = PcmCodec::default().encoder().unwrap();
        for amplitude in [0.1f32, 0.2, 0.3] {
            let packet = encoder.encode(&[amplitude; FRAME_SIZE]).unwrap();
            remote.send_to(&packet, local.local_addr().unwrap()).unwrap();
        }
        // Registrierungs-Datagramm ohne Nutzdaten
        remote.send_to(&[], local.local_addr().unwrap()).unwrap();

        let codec = PcmCodec::default();
        let mut decoder = codec.decoder().unwrap();
        let mut sink = RecordingSink::new().cancel_after(5, cancel.clone());
        let played = Arc::clone(&sink.samples);

        run_playback(&mut sink, decoder.as_mut(), &ctx).unwrap();

        let played = played.lock();
        for (index, amplitude) in [0.1f32, 0.2, 0.3].iter().enumerate() {
            let frame = &played[index * FRAME_SIZE..(index + 1) * FRAME_SIZE];
            assert!(frame.iter().all(|s| (s - amplitude).abs() < 1e-3));
        }
        assert!(played[3 * FRAME_SIZE..].iter().all(|&s| s == 0.0));
        assert_eq!(codec.decoded.load(Ordering::SeqCst), 3);
        assert_eq!(codec.concealed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_loopback_session() {
        // Der Socket sendet an sich selbst: Capture-Flow → Playback-Flow
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        let outcome = RendezvousOutcome {
            socket,
            peer_address: PeerAddress::new(Ipv4Addr::LOCALHOST, port),
            relay: false,
        };

        let config = MediaConfig {
            receive_timeout_ms: 10,
            denoise: false,
            ..MediaConfig::default()
        };

        let frames: Vec<Vec<f32>> = vec![
            constant_frame(0.4),
            constant_frame(0.0),
            (0..FRAME_SIZE).map(|i| ((i % 100) as f32 / 100.0) - 0.5).collect(),
            constant_frame(0.0),
        ];
        let backend = Arc::new(ScriptedBackend::new(frames.concat()));
        let played = Arc::clone(&backend.played);
        let codec = PcmCodec::default();

        let session = MediaSession::new(outcome, config).unwrap();
        let running = session
            .start(backend, Arc::new(codec.clone()), CancellationToken::new())
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while codec.decoded.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let stats = running.shutdown().unwrap();

        // Stille wird nie gesendet
        assert_eq!(stats.packets_sent, 2);
        assert_eq!(stats.packets_received, 2);
        assert_eq!(stats.frames_suppressed, 2);

        let played = played.lock();
        let audible: Vec<&[f32]> = played
            .chunks_exact(FRAME_SIZE)
            .filter(|frame| frame.iter().any(|&s| s != 0.0))
            .collect();
        assert_eq!(audible.len(), 2);
        for (decoded, original) in audible.iter().zip([&frames[0], &frames[2]]) {
            for (d, o) in decoded.iter().zip(original.iter()) {
                assert!((d - o).abs() <= 1.0 / 16384.0);
            }
        }
    }

    #[test]
    fn test_device_failure_stops_session() {
        struct BrokenBackend;

        impl AudioBackend for BrokenBackend {
            fn open_source(&self) -> Result<Box<dyn AudioSource>, AudioError> {
                Err(AudioError::NoInputDevice)
            }

            fn open_sink(&self) -> Result<Box<dyn AudioSink>, AudioError> {
                Ok(Box::new(RecordingSink::new()))
            }
        }

        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let outcome = RendezvousOutcome {
            socket,
            peer_address: PeerAddress::new(Ipv4Addr::LOCALHOST, 9),
            relay: true,
        };

        let cancel = CancellationToken::new();
        let running = MediaSession::new(outcome, MediaConfig::default())
            .unwrap()
            .start(Arc::new(BrokenBackend), Arc::new(PcmCodec::default()), cancel.clone())
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !cancel.is_cancelled() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(cancel.is_cancelled());
        assert!(matches!(
            running.shutdown(),
            Err(MediaError::Audio(AudioError::NoInputDevice))
        ));
    }
}
