//! Call Supervisor
//!
//! Setzt einen Anruf aus Rendezvous und Media Session zusammen und besitzt
//! alles, was über einen einzelnen Schritt hinaus lebt: Cancellation,
//! Thread-Lebenszeit, Anruf-Status und Events.

use super::audio::AudioBackend;
use super::codec::CodecFactory;
use super::session::{MediaError, MediaSession};
use super::stats::{format_bytes, StatsSnapshot};
use crate::config::CallConfig;
use crate::rendezvous::{PeerAddress, RendezvousClient, RendezvousError, RendezvousState};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::Instrument;
use uuid::Uuid;

/// Takt, in dem ein laufender Anruf überwacht wird
const POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Rendezvous failed: {0}")]
    Rendezvous(#[from] RendezvousError),

    #[error("Media session failed: {0}")]
    Media(#[from] MediaError),

    #[error("Background task failed: {0}")]
    Task(String),
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CallState {
    /// Kein aktiver Anruf
    Idle,
    /// Verbindung zum Signaling-Server wird aufgebaut
    Connecting,
    /// Im Raum, aber noch allein
    WaitingForPartner,
    /// Audio fließt
    Connected { peer: PeerAddress, relay: bool },
    /// Anruf beendet
    Ended,
}

/// Events die vom CallSupervisor ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    Stats(StatsSnapshot),
    Error(String),
}

/// Wohin und in welchen Raum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub host: String,
    pub port: u16,
    pub room: String,
    pub relay: bool,
}

/// Wie ein Anruf zu Ende ging
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// Abgebrochen, bevor ein Partner gefunden wurde
    Cancelled,
    /// Gespräch hat stattgefunden
    Ended {
        peer: PeerAddress,
        relay: bool,
        stats: StatsSnapshot,
        duration: Duration,
    },
}

// ============================================================================
// CALL SUPERVISOR
// ============================================================================

pub struct CallSupervisor {
    config: CallConfig,
    backend: Arc<dyn AudioBackend>,
    codecs: Arc<dyn CodecFactory>,
    state: Arc<Mutex<CallState>>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallSupervisor {
    pub fn new(
        config: CallConfig,
        backend: Arc<dyn AudioBackend>,
        codecs: Arc<dyn CodecFactory>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            config,
            backend,
            codecs,
            state: Arc::new(Mutex::new(CallState::Idle)),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> CallState {
        self.state.lock().clone()
    }

    /// Führt einen kompletten Anruf durch
    ///
    /// Kehrt zurück, wenn `cancel` ausgelöst wird oder ein Flow fehlschlägt.
    pub async fn run(
        &self,
        request: CallRequest,
        cancel: CancellationToken,
    ) -> Result<CallOutcome, CallError> {
        let call_id = Uuid::new_v4();
        let span = tracing::info_span!("call", id = %call_id);

        let result = self.run_call(request, cancel).instrument(span).await;

        if let Err(e) = &result {
            tracing::error!("Call {} failed: {}", call_id, e);
            let _ = self.event_tx.send(CallEvent::Error(e.to_string()));
        }
        self.set_state(CallState::Ended);

        result
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    async fn run_call(
        &self,
        request: CallRequest,
        cancel: CancellationToken,
    ) -> Result<CallOutcome, CallError> {
        tracing::info!(
            "Calling room via {}:{} (relay: {})",
            request.host,
            request.port,
            request.relay
        );
        self.set_state(CallState::Connecting);

        let client = RendezvousClient::new(self.config.rendezvous.clone(), cancel.clone());
        let mut states = client.subscribe();

        // Wird `run` fallen gelassen, darf der Handshake die TCP-Verbindung nicht weiter halten
        let mut rendezvous = AbortOnDropHandle::new(tokio::spawn(
            async move {
                client
                    .connect(&request.host, request.port, &request.room, request.relay)
                    .await
            }
            .in_current_span(),
        ));

        let outcome = loop {
            tokio::select! {
                joined = &mut rendezvous => {
                    break joined.map_err(|e| CallError::Task(e.to_string()))??;
                }
                Ok(()) = states.changed() => {
                    let state = states.borrow_and_update().clone();
                    self.on_rendezvous_state(&state);
                }
            }
        };

        let Some(outcome) = outcome else {
            tracing::info!("Call cancelled before a partner was found");
            return Ok(CallOutcome::Cancelled);
        };

        let peer = outcome.peer_address;
        let relay = outcome.relay;

        let session = MediaSession::new(outcome, self.config.media.clone())?;
        let running = session.start(
            Arc::clone(&self.backend),
            Arc::clone(&self.codecs),
            cancel.child_token(),
        )?;

        self.set_state(CallState::Connected { peer, relay });

        let started = Instant::now();
        let stats_interval = self.config.media.stats_interval();
        let mut next_stats = started + stats_interval;
        let session_cancel = running.cancel_token();

        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = session_cancel.cancelled() => break,
                _ = poll.tick() => {}
            }

            if running.is_finished() {
                break;
            }

            if Instant::now() >= next_stats {
                next_stats += stats_interval;
                let stats = running.stats();
                tracing::debug!(
                    "sent {} packets ({}), received {} packets ({}), concealed {} frames",
                    stats.packets_sent,
                    format_bytes(stats.bytes_sent),
                    stats.packets_received,
                    format_bytes(stats.bytes_received),
                    stats.frames_concealed
                );
                // Ein nicht weiterleitendes Relay sieht genauso aus wie Paketverlust
                if stats.packets_received == 0 {
                    tracing::warn!("No audio received from {} yet", peer);
                }
                let _ = self.event_tx.send(CallEvent::Stats(stats));
            }
        }

        // Flows blockieren bis zu einem Empfangs-Timeout; nicht auf dem Runtime-Thread joinen
        let stats = tokio::task::spawn_blocking(move || running.shutdown())
            .await
            .map_err(|e| CallError::Task(e.to_string()))??;

        let duration = started.elapsed();
        tracing::info!(
            "Call with {} ended after {:.1}s",
            peer,
            duration.as_secs_f32()
        );
        let _ = self.event_tx.send(CallEvent::Stats(stats));

        Ok(CallOutcome::Ended {
            peer,
            relay,
            stats,
            duration,
        })
    }

    fn on_rendezvous_state(&self, state: &RendezvousState) {
        tracing::debug!("Rendezvous state: {:?}", state);

        if *state == RendezvousState::Waiting {
            self.set_state(CallState::WaitingForPartner);
        }
    }

    fn set_state(&self, new_state: CallState) {
        let mut state = self.state.lock();
        if *state == new_state {
            return;
        }
        *state = new_state.clone();
        drop(state);

        let _ = self.event_tx.send(CallEvent::StateChanged(new_state));
    }
}

// ============================================================================
// TESTS
// ============================================================================
