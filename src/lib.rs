//! Frontdoor - the public entry point of the enrollment product
//!
//! A single process that:
//! - Answers the platform health check on the public port immediately
//! - Spawns and supervises the backend apps with a restart budget and cooldown
//! - Polls each backend's health endpoint with backoff until it is ready
//! - Hands the public socket to a router that proxies HTTP and WebSocket
//!   traffic by path prefix, serves the landing page and forwards chat turns
//!   to a completion API

pub mod assets;
pub mod chat;
pub mod config;
pub mod error;
pub mod handoff;
pub mod placeholder;
pub mod pool;
pub mod probe;
pub mod proxy;
pub mod routes;
pub mod sockets;
pub mod supervisor;
pub mod upgrade;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
