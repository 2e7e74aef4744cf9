//! burrow-client: the client side of the burrow reverse-tunneling proxy.
//!
//! Maintains a single control connection to the server with exponential
//! reconnect backoff, registers the configured tunnels, answers heartbeat
//! checks, and dials a fresh proxy leg for every public connection the
//! server solicits.

pub mod backoff;
pub mod client;
pub mod config;
mod proxy;
mod transport;

pub use backoff::Backoff;
pub use client::{ActiveTunnel, Client};
pub use config::{ClientSection, ConfigFile, LogSection, TunnelSection};
