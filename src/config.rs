//! CLI configuration.
//!
//! Nothing here is load-bearing for the core tunnel engine itself; `P` and
//! `cap` are otherwise build-time constants, so they're exposed as flags
//! with sensible defaults.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "wstunnel-relay", about = "Server-side endpoint of a WebSocket-carried TCP proxy tunnel")]
pub struct Config {
    /// Address to listen on.
    #[arg(long, env = "WSTUNNEL_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Path the WebSocket upgrade is served on.
    #[arg(long, env = "WSTUNNEL_PATH", default_value = "/tun")]
    pub path: String,

    /// Per-tunnel Request Table capacity.
    #[arg(long, env = "WSTUNNEL_CAP", default_value_t = 100)]
    pub cap: usize,

    /// Keepalive period `P`, in seconds. Three missed pongs (~3P) closes a
    /// tunnel.
    #[arg(long, env = "WSTUNNEL_KEEPALIVE_SECS", default_value_t = 10)]
    pub keepalive_secs: u64,
}

impl Config {
    pub fn keepalive_period(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}
