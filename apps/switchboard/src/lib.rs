pub mod cli;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod telemetry;
pub mod websocket;
