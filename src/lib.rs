//! Lobbygate - A reverse proxy that keeps players connected to a sleeping game server
//!
//! This library provides a stateful proxy that:
//! - Starts the backend server when the first player logs in
//! - Parks players in a static holding world while the backend is unavailable
//! - Moves players onto the backend once it is ready, and back when it stops
//! - Rewrites entity ids in flight so they stay stable across backend restarts
//! - Stops (or hibernates via CRIU) the backend after the last player leaves

pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod error;
pub mod holding;
pub mod identity;
pub mod lifecycle;
pub mod logtail;
pub mod packet;
pub mod process;
pub mod server;
pub mod session;
pub mod translate;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
