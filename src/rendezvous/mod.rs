//! Rendezvous Module - TCP-Handshake mit dem Signaling-Server
//!
//! Dieses Modul verwaltet die Koordination vor dem Anruf:
//! - Raum-Digest und Relay-Präferenz an den Server senden
//! - Signale auswerten (Warteschlange, Partner gefunden, Liveness)
//! - UDP-Endpunkt registrieren und Peer-Adresse auflösen

mod address;
mod client;
mod messages;

pub use address::{FramingError, PeerAddress, ADDRESS_LEN};
pub use client::{RendezvousClient, RendezvousError, RendezvousOutcome, RendezvousState};
pub use messages::{JoinRequest, RoomDigest, Signal, JOIN_REQUEST_LEN, ROOM_DIGEST_LEN};
