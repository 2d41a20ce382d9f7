mod config;
mod egress;
mod frame;
mod http;
mod manager;
mod slot;
mod table;
mod tunnel;

use clap::Parser;
use config::Config;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use manager::TunnelManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::parse();
    let manager = TunnelManager::new(config.cap, config.keepalive_period());
    let tun_path: Arc<str> = Arc::from(config.path.as_str());

    let listener = TcpListener::bind(config.listen).await?;
    info!(addr = %config.listen, path = %tun_path, cap = config.cap, "wstunnel relay listening");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(v) => v,
            Err(err) => {
                warn!("failed to accept connection: {err}");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);

        let manager = manager.clone();
        let tun_path = tun_path.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| http::route(manager.clone(), tun_path.clone(), req));

            if let Err(err) = http1::Builder::new().serve_connection(io, service).with_upgrades().await {
                debug!(peer = %peer_addr, "connection error: {err}");
            }
        });
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_timer(tracing_subscriber::fmt::time::LocalTime::rfc_3339())
        .init();
}
