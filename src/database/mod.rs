//! Database Module - lokale Raum-Historie

mod rooms;

pub use rooms::{DatabaseError, NewRecentRoom, RecentRoom, RecentRoomsDatabase};
