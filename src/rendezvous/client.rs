//! Rendezvous Client
//!
//! Führt den TCP-Handshake mit dem Signaling-Server durch:
//! - Raum-Digest und Relay-Präferenz senden
//! - Signale lesen bis PARTNER_FOUND (mit Geduld-Zähler)
//! - UDP-Socket öffnen und Registrierungs-Datagramm senden
//! - Peer-Adresse auflösen (direkt oder über Relay)

use super::address::{FramingError, PeerAddress, ADDRESS_LEN};
use super::messages::{JoinRequest, RoomDigest, Signal};
use crate::config::RendezvousConfig;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum RendezvousError {
    #[error("Failed to resolve signaling host '{host}': {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("Signaling host '{0}' has no IPv4 address")]
    UnsupportedHost(String),

    #[error("Failed to connect to signaling server {addr}: {source}")]
    Connect {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },

    #[error("Timed out connecting to signaling server {0}")]
    ConnectTimeout(SocketAddrV4),

    #[error("Protocol error: unexpected signal from server: {0}")]
    UnexpectedSignal(u8),

    #[error("Protocol error: {0}")]
    Framing(#[from] FramingError),

    #[error("Server is not responding (gave up after {timeouts} read timeouts)")]
    Unresponsive { timeouts: u32 },

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Signaling connection closed by server")]
    ConnectionClosed,

    #[error("Signaling I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RendezvousError {
    /// Verstöße gegen das Wire-Protokoll (unbekanntes Signal, falsche Adresslänge)
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            RendezvousError::UnexpectedSignal(_) | RendezvousError::Framing(_)
        )
    }
}

// ============================================================================
// STATE & OUTCOME
// ============================================================================

/// Zustand des Handshakes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendezvousState {
    Connecting,
    AwaitingSignal,
    /// Server hat uns in die Warteschlange des Raums gestellt
    Waiting,
    PartnerFound { udp_port: u16 },
    ExchangingAddress,
    Resolved,
    Failed(String),
}

/// Ergebnis eines erfolgreichen Handshakes
///
/// Wird genau einmal pro Anrufversuch erzeugt und an die MediaSession
/// übergeben.
#[derive(Debug)]
pub struct RendezvousOutcome {
    pub socket: UdpSocket,
    pub peer_address: PeerAddress,
    pub relay: bool,
}

// ============================================================================
// RENDEZVOUS CLIENT
// ============================================================================

pub struct RendezvousClient {
    config: RendezvousConfig,
    cancel: CancellationToken,
    state_tx: watch::Sender<RendezvousState>,
}

impl RendezvousClient {
    pub fn new(config: RendezvousConfig, cancel: CancellationToken) -> Self {
        let (state_tx, _) = watch::channel(RendezvousState::Connecting);

        Self {
            config,
            cancel,
            state_tx,
        }
    }

    /// Gibt einen Receiver für Zustandsänderungen zurück
    pub fn subscribe(&self) -> watch::Receiver<RendezvousState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> RendezvousState {
        self.state_tx.borrow().clone()
    }

    /// Verbindet mit dem Signaling-Server und führt den Handshake durch
    ///
    /// `Ok(None)` bedeutet, dass der Vorgang abgebrochen wurde.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        room: &str,
        relay: bool,
    ) -> Result<Option<RendezvousOutcome>, RendezvousError> {
        self.set_state(RendezvousState::Connecting);

        let (mut stream, server) = match self.open_stream(host, port).await {
            Ok(Some(opened)) => opened,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.set_state(RendezvousState::Failed(e.to_string()));
                return Err(e);
            }
        };

        // Die TCP-Verbindung wird am Ende dieser Funktion geschlossen
        self.negotiate(&mut stream, *server.ip(), &RoomDigest::of(room), relay)
            .await
    }

    /// Handshake über einen bereits geöffneten Signaling-Stream
    pub async fn negotiate<S>(
        &self,
        stream: &mut S,
        host: Ipv4Addr,
        room: &RoomDigest,
        relay: bool,
    ) -> Result<Option<RendezvousOutcome>, RendezvousError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.negotiate_inner(stream, host, room, relay).await;

        match &result {
            Ok(Some(_)) => self.set_state(RendezvousState::Resolved),
            Ok(None) => tracing::info!("Rendezvous cancelled"),
            Err(e) => self.set_state(RendezvousState::Failed(e.to_string())),
        }

        result
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    async fn open_stream(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Option<(TcpStream, SocketAddrV4)>, RendezvousError> {
        let server = resolve_ipv4(host, port).await?;

        tracing::info!("Connecting to signaling server {}", server);

        let connect = tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(server));

        let stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(None),
            result = connect => result
                .map_err(|_| RendezvousError::ConnectTimeout(server))?
                .map_err(|source| RendezvousError::Connect { addr: server, source })?,
        };

        // Einzelne Bytes (READY-Echo) sofort senden
        stream.set_nodelay(true)?;

        Ok(Some((stream, server)))
    }

    async fn negotiate_inner<S>(
        &self,
        stream: &mut S,
        host: Ipv4Addr,
        room: &RoomDigest,
        relay: bool,
    ) -> Result<Option<RendezvousOutcome>, RendezvousError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::debug!("Joining room {:?} (relay: {})", room, relay);

        let request = JoinRequest::new(room.clone(), relay);
        stream.write_all(&request.to_bytes()).await?;
        stream.flush().await?;

        self.set_state(RendezvousState::AwaitingSignal);

        let Some(udp_port) = self.await_partner(stream).await? else {
            return Ok(None);
        };

        self.set_state(RendezvousState::PartnerFound { udp_port });

        let server_udp = SocketAddrV4::new(host, udp_port);
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;

        // Leeres Datagramm: Server lernt unseren UDP-Endpunkt (und öffnet das NAT-Mapping)
        socket.send_to(&[], server_udp)?;
        tracing::debug!(
            "Sent registration datagram from {} to {}",
            socket.local_addr()?,
            server_udp
        );

        let peer_address = if relay {
            PeerAddress::from(server_udp)
        } else {
            self.set_state(RendezvousState::ExchangingAddress);
            match self.read_peer_address(stream).await? {
                Some(address) => address,
                None => return Ok(None),
            }
        };

        tracing::info!(
            "Rendezvous complete: peer {} ({})",
            peer_address,
            if relay { "relay" } else { "direct" }
        );

        Ok(Some(RendezvousOutcome {
            socket,
            peer_address,
            relay,
        }))
    }

    /// Liest Signale bis PARTNER_FOUND und gibt den UDP-Port des Servers zurück
    async fn await_partner<S>(&self, stream: &mut S) -> Result<Option<u16>, RendezvousError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let read_timeout = self.config.read_timeout();
        let mut patience = self.config.idle_patience;
        let mut timeouts = 0u32;
        let mut byte = [0u8; 1];

        loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(None),
                read = tokio::time::timeout(read_timeout, stream.read(&mut byte)) => read,
            };

            let size = match read {
                Ok(result) => result?,
                Err(_elapsed) => {
                    timeouts += 1;
                    patience = patience.saturating_sub(1);
                    if patience == 0 {
                        return Err(RendezvousError::Unresponsive { timeouts });
                    }
                    continue;
                }
            };

            if size == 0 {
                return Err(RendezvousError::ConnectionClosed);
            }

            match Signal::try_from(byte[0]) {
                Ok(Signal::WaitingInRoom) => {
                    tracing::debug!("Waiting in room for a partner");
                    patience = self.config.waiting_patience;
                    timeouts = 0;
                    self.set_state(RendezvousState::Waiting);
                }
                Ok(Signal::PartnerFound) => {
                    let mut port = [0u8; 2];
                    if self
                        .read_exact_bounded(stream, &mut port, "partner UDP port")
                        .await?
                        .is_none()
                    {
                        return Ok(None);
                    }
                    let udp_port = u16::from_be_bytes(port);
                    tracing::info!("Partner found, server UDP port {}", udp_port);
                    return Ok(Some(udp_port));
                }
                Ok(Signal::Ready) => {
                    tracing::trace!("Answering READY");
                    stream.write_all(&[u8::from(Signal::Ready)]).await?;
                    stream.flush().await?;
                }
                Err(unknown) => return Err(RendezvousError::UnexpectedSignal(unknown)),
            }
        }
    }

    /// Liest die 6-Byte Peer-Adresse (ein Read-Burst, beliebige andere Länge ist fatal)
    async fn read_peer_address<S>(
        &self,
        stream: &mut S,
    ) -> Result<Option<PeerAddress>, RendezvousError>
    where
        S: AsyncRead + Unpin,
    {
        let deadline = tokio::time::Instant::now() + self.config.exchange_timeout();
        let mut buffer = [0u8; 64];
        let mut filled = 0;

        while filled < ADDRESS_LEN {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(None),
                read = tokio::time::timeout_at(deadline, stream.read(&mut buffer[filled..])) => read,
            };

            match read.map_err(|_| RendezvousError::Timeout("peer address"))? {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Some(PeerAddress::decode(&buffer[..filled])?))
    }

    /// Liest genau `buf.len()` Bytes; `Ok(None)` bei Abbruch
    async fn read_exact_bounded<S>(
        &self,
        stream: &mut S,
        buf: &mut [u8],
        what: &'static str,
    ) -> Result<Option<()>, RendezvousError>
    where
        S: AsyncRead + Unpin,
    {
        let read = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(None),
            read = tokio::time::timeout(self.config.exchange_timeout(), stream.read_exact(buf)) => read,
        };

        match read {
            Ok(Ok(_)) => Ok(Some(())),
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(RendezvousError::ConnectionClosed)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(RendezvousError::Timeout(what)),
        }
    }

    fn set_state(&self, state: RendezvousState) {
        tracing::trace!("Rendezvous state: {:?}", state);
        self.state_tx.send_replace(state);
    }
}

/// Löst den Signaling-Host zu einer IPv4-Adresse auf
async fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddrV4, RendezvousError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| RendezvousError::Resolve {
            host: host.to_string(),
            source,
        })?;

    addrs
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| RendezvousError::UnsupportedHost(host.to_string()))
}

// ============================================================================
// TESTS
// ============================================================================
