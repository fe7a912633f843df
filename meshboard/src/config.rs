//! Runtime configuration.
//!
//! Everything is a CLI flag with an environment fallback. The defaults are
//! the classic ones for this protocol: port 5555, 5-second keep-alive
//! sweeps, a 10-second cap on holding the token.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "meshboard", about = "Peer-to-peer shared drawing board")]
pub struct Config {
    /// TCP port to listen on.
    #[arg(short = 'p', long, env = "MESHBOARD_PORT", default_value_t = 5555)]
    pub port: u16,

    /// Address (host:port) of a participant to join at startup.
    #[arg(long, env = "MESHBOARD_CONNECT")]
    pub connect: Option<String>,

    /// Seconds between keep-alive heartbeats and failure-detector sweeps.
    #[arg(long, env = "MESHBOARD_KEEP_ALIVE_INTERVAL", default_value_t = 5)]
    pub keep_alive_interval: u64,

    /// Seconds without inbound traffic before a peer is considered dead.
    #[arg(long, env = "MESHBOARD_KEEP_ALIVE_TIMEOUT", default_value_t = 15)]
    pub keep_alive_timeout: u64,

    /// Seconds a participant may hold the token before auto-resigning.
    #[arg(long, env = "MESHBOARD_TOKEN_MAX_TIME", default_value_t = 10)]
    pub token_ownership_max_time: u64,

    /// Points per paint batch before a stroke is force-flushed.
    #[arg(long, env = "MESHBOARD_LINE_MAX_LENGTH", default_value_t = 30)]
    pub line_max_length: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5555,
            connect: None,
            keep_alive_interval: 5,
            keep_alive_timeout: 15,
            token_ownership_max_time: 10,
            line_max_length: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_port_flag_is_parsed() {
        let config = Config::parse_from(["meshboard", "-p", "6001"]);
        assert_eq!(config.port, 6001);
        assert_eq!(config.keep_alive_interval, 5);
        assert!(config.connect.is_none());
    }

    #[test]
    fn defaults_match_cli_defaults() {
        let parsed = Config::parse_from(["meshboard"]);
        let defaulted = Config::default();
        assert_eq!(parsed.port, defaulted.port);
        assert_eq!(parsed.keep_alive_timeout, defaulted.keep_alive_timeout);
        assert_eq!(
            parsed.token_ownership_max_time,
            defaulted.token_ownership_max_time
        );
        assert_eq!(parsed.line_max_length, defaulted.line_max_length);
    }
}
