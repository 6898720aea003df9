//! Peer-Adressen im Wire-Format
//!
//! Der Signaling-Server übermittelt die Medienadresse des Partners als
//! 6 Bytes: 4 Bytes IPv4-Adresse, gefolgt vom Port in Big-Endian.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use thiserror::Error;

/// Länge einer kodierten Adresse (IPv4 + Port)
pub const ADDRESS_LEN: usize = 6;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("expected {ADDRESS_LEN} address bytes (ipv4 + port), got {0}")]
pub struct FramingError(pub usize);

// ============================================================================
// PEER ADDRESS
// ============================================================================

/// Medienadresse des Gesprächspartners (oder des Relays)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Kodiert die Adresse in das 6-Byte Wire-Format
    pub fn encode(&self) -> [u8; ADDRESS_LEN] {
        let [a, b, c, d] = self.ip.octets();
        let [hi, lo] = self.port.to_be_bytes();
        [a, b, c, d, hi, lo]
    }

    /// Dekodiert eine Adresse; schlägt fehl, wenn nicht exakt 6 Bytes vorliegen
    pub fn decode(bytes: &[u8]) -> Result<Self, FramingError> {
        let [a, b, c, d, hi, lo]: [u8; ADDRESS_LEN] =
            bytes.try_into().map_err(|_| FramingError(bytes.len()))?;

        Ok(Self {
            ip: Ipv4Addr::new(a, b, c, d),
            port: u16::from_be_bytes([hi, lo]),
        })
    }
}

impl From<SocketAddrV4> for PeerAddress {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl From<PeerAddress> for SocketAddrV4 {
    fn from(addr: PeerAddress) -> Self {
        SocketAddrV4::new(addr.ip, addr.port)
    }
}

impl From<PeerAddress> for SocketAddr {
    fn from(addr: PeerAddress) -> Self {
        SocketAddr::V4(addr.into())
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

// ============================================================================
// TESTS
// ============================================================================
