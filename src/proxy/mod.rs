use std::sync::Arc;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::{Method, Request, Response, StatusCode, body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

use crate::config::Settings;

mod context;
mod forward;
mod http_connect;
mod line_reader;
mod protocol_detect;
mod relay;
mod upstream;

use context::RequestContext;
use forward::{HttpForwarder, handle_http};
use http_connect::handle_connect;
use protocol_detect::detect_tls;
use upstream::UpstreamConnector;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("HTTP connection error: {0}")]
    Serve(#[from] hyper::Error),
    #[error("Failed during I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a connection handler needs, built once from the settings.
pub struct Proxy {
    settings: Arc<Settings>,
    connector: UpstreamConnector,
    forwarder: HttpForwarder,
}

impl Proxy {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            connector: UpstreamConnector::new(&settings),
            forwarder: HttpForwarder::new(&settings),
            settings,
        }
    }
}

/// Responds with `status` and `message` as a plain text body, logging it.
fn error_response(status: StatusCode, message: String) -> Response<ProxyBody> {
    error!("{message}");
    let mut resp = Response::new(
        Full::new(Bytes::from(message))
            .map_err(|never| match never {})
            .boxed(),
    );
    *resp.status_mut() = status;
    resp
}

async fn handle_request(
    req: Request<Incoming>,
    ctx: RequestContext,
    proxy: Arc<Proxy>,
) -> Result<Response<ProxyBody>, hyper::Error> {
    if req.method() == Method::CONNECT {
        Ok(handle_connect(req, ctx, &proxy).await)
    } else {
        Ok(handle_http(req, ctx, &proxy.forwarder).await)
    }
}

async fn serve_connection(
    proxy: Arc<Proxy>,
    ctx: RequestContext,
    socket: TcpStream,
) -> Result<(), ProxyError> {
    socket.set_nodelay(proxy.settings.tcp_nodelay)?;
    let io = TokioIo::new(socket);

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(
            io,
            service_fn(move |req| handle_request(req, ctx, proxy.clone())),
        )
        .with_upgrades()
        .await?;

    Ok(())
}

pub async fn start(
    settings: Arc<Settings>,
    listener: TcpListener,
) -> anyhow::Result<()> {
    match settings.upstream_proxy {
        Some(ref upstream) => info!("Forwarding through upstream proxy {upstream}"),
        None => info!("No upstream proxy configured, connecting directly"),
    }
    let proxy = Arc::new(Proxy::new(settings));

    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept a connection: {e}");
                continue;
            }
        };

        let proxy = proxy.clone();
        let ctx = RequestContext::new(addr);

        tokio::spawn(async move {
            match detect_tls(&socket).await {
                Ok(true) => {
                    error!("TLS received from {addr}, but this proxy only speaks plain HTTP");
                }

                Ok(false) => {
                    if let Err(e) = serve_connection(proxy, ctx, socket).await {
                        error!("Proxy error from {addr}: {e}");
                    }
                }

                Err(err) => {
                    error!("While detecting the header for TLS from {addr}, error occurred: {err:?}");
                }
            }
        });
    }
}
