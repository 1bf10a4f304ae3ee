use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{ensure, Context};

use crate::cli::ServeArgs;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// How often the server pings each connection
    pub ping_interval: Duration,
    /// Connections silent for this long are closed
    pub idle_timeout: Duration,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            ping_interval: Duration::from_secs(25),
            idle_timeout: Duration::from_secs(60),
            log_filter: "info".to_string(),
        }
    }
}

impl TryFrom<ServeArgs> for Config {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        ensure!(
            args.ping_interval_secs > 0,
            "ping interval must be greater than zero"
        );
        // A healthy peer answers at least one ping before it can be timed out.
        ensure!(
            args.idle_timeout_secs > args.ping_interval_secs,
            "idle timeout ({}s) must exceed the ping interval ({}s)",
            args.idle_timeout_secs,
            args.ping_interval_secs
        );

        Ok(Self {
            listen_addr,
            ping_interval: Duration::from_secs(args.ping_interval_secs),
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            log_filter: args.log_filter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(listen_addr: &str, ping: u64, idle: u64) -> ServeArgs {
        ServeArgs {
            listen_addr: listen_addr.to_string(),
            ping_interval_secs: ping,
            idle_timeout_secs: idle,
            log_filter: "debug".to_string(),
        }
    }

    #[test_timeout::timeout]
    fn builds_config_from_args() {
        let config = Config::try_from(args("127.0.0.1:4000", 10, 30)).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(config.ping_interval, Duration::from_secs(10));
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.log_filter, "debug");
    }

    #[test_timeout::timeout]
    fn rejects_bad_listen_address() {
        let err = Config::try_from(args("localhost", 10, 30)).unwrap_err();
        assert!(err.to_string().contains("invalid listen address"));
    }

    #[test_timeout::timeout]
    fn idle_timeout_must_exceed_ping_interval() {
        assert!(Config::try_from(args("0.0.0.0:3000", 30, 30)).is_err());
        assert!(Config::try_from(args("0.0.0.0:3000", 0, 30)).is_err());
    }
}
