pub mod client;
pub mod frame;
pub mod handshake;
pub mod server;

/// Application-level liveness probe, sent as a text frame.
pub const PING: &str = "PING";
/// Reply to [`PING`].
pub const PONG: &str = "PONG";

pub use client::{run_command_loop, ClientConfig, ClientTransport, GatewayOutbox};
pub use server::{GatewayServer, Registry, ServerConfig, WatchdogGate};
