//! Gateway side of the tunnel: control sessions, proxy command parsing and
//! the registry of proxies announced by connected clients.

pub mod client;
pub mod command;
pub mod registry;
pub mod server;
pub mod service;
pub mod transport;
pub mod wire;
