//! roomcall - P2P Voice Calls über einen Rendezvous-Server
//!
//! Zwei Clients, die denselben Raumnamen kennen, finden sich über einen
//! Signaling-Server und telefonieren danach direkt (oder über das Relay):
//! - TCP-Rendezvous mit SHA-512 Raum-Digest
//! - UDP Hole-Punching
//! - Opus über rohe UDP-Datagramme mit Voice Activity Detection
//! - SQLite für die lokale Raum-Historie

pub mod call_engine;
pub mod config;
pub mod database;
pub mod rendezvous;

use config::{CallConfig, ConfigError};
use database::{DatabaseError, RecentRoomsDatabase};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging
///
/// `RUST_LOG` hat Vorrang; ohne Angabe wird `roomcall=info` geloggt
/// (`roomcall=debug` mit `verbose`).
pub fn init_logging(verbose: bool) {
    let default_directive = if verbose { "roomcall=debug" } else { "roomcall=info" };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    // Zweiter Aufruf (z.B. in Tests) ist kein Fehler
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

// ============================================================================
// APPLICATION CONTEXT
// ============================================================================

/// Alles, was ein Prozess über mehrere Anrufe hinweg teilt
///
/// Wird explizit herumgereicht; es gibt keinen globalen Zustand.
pub struct AppContext {
    pub config: CallConfig,
    pub history: Option<Arc<RecentRoomsDatabase>>,
}

impl AppContext {
    /// Lädt Konfiguration und (optional) die Raum-Historie
    pub fn init(config_path: Option<&Path>, with_history: bool) -> Result<Self, InitError> {
        tracing::info!("Initializing roomcall...");

        let config = CallConfig::load(config_path)?;

        let history = if with_history {
            let database = RecentRoomsDatabase::open()?;
            tracing::info!("Database opened");
            Some(Arc::new(database))
        } else {
            None
        };

        Ok(Self { config, history })
    }
}
