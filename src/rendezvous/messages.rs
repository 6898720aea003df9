//! Wire-Vokabular des Rendezvous-Protokolls
//!
//! Client → Server: 64 Bytes SHA-512 Digest des Raumnamens, dann 1 Byte
//! Relay-Präferenz. Server → Client: einzelne Signal-Bytes.

use sha2::{Digest, Sha512};
use std::fmt;

/// Länge des Raum-Digests (SHA-512)
pub const ROOM_DIGEST_LEN: usize = 64;

/// Länge der Join-Anfrage (Digest + Relay-Byte)
pub const JOIN_REQUEST_LEN: usize = ROOM_DIGEST_LEN + 1;

// ============================================================================
// SIGNALS
// ============================================================================

/// Signal-Byte vom Signaling-Server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Signal {
    /// Raum existiert, wir stehen in der Warteschlange
    WaitingInRoom = 1,
    /// Partner gefunden, es folgen 2 Bytes UDP-Port
    PartnerFound = 2,
    /// Liveness-Check, muss mit READY beantwortet werden
    Ready = 3,
}

impl TryFrom<u8> for Signal {
    /// Das unbekannte Byte
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            1 => Ok(Signal::WaitingInRoom),
            2 => Ok(Signal::PartnerFound),
            3 => Ok(Signal::Ready),
            other => Err(other),
        }
    }
}

impl From<Signal> for u8 {
    fn from(signal: Signal) -> Self {
        signal as u8
    }
}

// ============================================================================
// ROOM DIGEST
// ============================================================================

/// SHA-512 Digest eines Raumnamens
///
/// Der Raumname verlässt den Client nie im Klartext; der Server vergleicht
/// ausschließlich Digests.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RoomDigest([u8; ROOM_DIGEST_LEN]);

impl RoomDigest {
    pub fn of(room: &str) -> Self {
        let mut digest = [0u8; ROOM_DIGEST_LEN];
        digest.copy_from_slice(&Sha512::digest(room.as_bytes()));
        Self(digest)
    }

    pub fn as_bytes(&self) -> &[u8; ROOM_DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Debug for RoomDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Die ersten 8 Bytes reichen zum Wiedererkennen in Logs
        write!(f, "RoomDigest(")?;
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "…)")
    }
}

// ============================================================================
// JOIN REQUEST
// ============================================================================

/// Erste Nachricht an den Server
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub room: RoomDigest,
    pub relay: bool,
}

impl JoinRequest {
    pub fn new(room: RoomDigest, relay: bool) -> Self {
        Self { room, relay }
    }

    pub fn to_bytes(&self) -> [u8; JOIN_REQUEST_LEN] {
        let mut bytes = [0u8; JOIN_REQUEST_LEN];
        bytes[..ROOM_DIGEST_LEN].copy_from_slice(self.room.as_bytes());
        bytes[ROOM_DIGEST_LEN] = u8::from(self.relay);
        bytes
    }
}

// ============================================================================
// TESTS
// ============================================================================
