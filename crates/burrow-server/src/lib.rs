//! Server side of the burrow reverse-tunneling proxy.
//!
//! Accepts public HTTP/HTTPS/TCP connections, matches them to tunnels
//! registered by clients over a persistent control channel, and splices
//! each public connection onto a client-supplied proxy connection.

pub mod config;
pub mod control;
pub mod http;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod tunnel;
pub mod vhost;

pub use config::{ConfigFile, LogSection, ServerConfig};
pub use server::{Context, Server};
