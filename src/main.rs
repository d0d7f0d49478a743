use std::{net::IpAddr, path::PathBuf, sync::Arc};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, debug};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use std::os::fd::FromRawFd;

mod config;
mod proxy;
mod systemd;

/// `FileDescriptorName=` of the socket unit handing us the listener.
const PROXY_SOCKET_NAME: &str = "proxy";

#[derive(Debug, Parser)]
#[command(name = "relais", version)]
#[command(about = "Forward HTTP/HTTPS proxy with optional upstream proxy chaining", long_about = None)]
struct Args {
    /// TOML configuration file (defaults to ./config.toml when present)
    config: Option<PathBuf>,

    /// Upstream proxy (`host:port`), overrides `upstream-proxy`; empty means direct
    #[arg(long)]
    upstream_proxy: Option<String>,

    #[arg(long)]
    listen_address: Option<IpAddr>,

    #[arg(short = 'p', long)]
    listen_port: Option<u16>,
}

impl Args {
    fn apply(&self, settings: &mut config::Settings) {
        if let Some(ref upstream) = self.upstream_proxy {
            let upstream = upstream.trim();
            settings.upstream_proxy = (!upstream.is_empty()).then(|| upstream.to_owned());
        }
        if let Some(address) = self.listen_address {
            settings.listen_address = address;
        }
        if let Some(port) = self.listen_port {
            settings.listen_port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut settings = config::init(args.config.clone())?;
    args.apply(&mut settings);
    let settings: Arc<config::Settings> = Arc::new(settings);

    let listener = match systemd::listen_fds_named().get(PROXY_SOCKET_NAME) {
        Some(fd) => {
            debug!("using socket-activated listener fd {fd}");
            let std = unsafe { std::net::TcpListener::from_raw_fd(*fd) };
            std.set_nonblocking(true)?;
            TcpListener::from_std(std)?
        }
        None => {
            let addr = settings.listen_socket_address();
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to listen on {addr}"))?
        }
    };
    info!("listening on {}", listener.local_addr()?);

    if let Err(e) = systemd::sd_notify_ready() {
        debug!("systemd readiness notification failed: {e}");
    }

    proxy::start(settings, listener).await?;

    info!("exiting");

    Ok(())
}
