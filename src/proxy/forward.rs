use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::{
    body::Incoming,
    rt::{Read, ReadBufCursor, Write},
    Request, Response, StatusCode, Uri,
};
use hyper_util::client::legacy::{
    self,
    connect::{Connected, Connection},
    Client,
};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use thiserror::Error;
use tokio::net::TcpStream;
use tower::Service;
use tracing::info;

use crate::config::Settings;
use crate::proxy::{context::RequestContext, error_response, upstream::dial, ProxyBody};

/// Idle pooled connections are closed after this long.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 8;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to reach {address}")]
    Dial {
        address: String,
        #[source]
        source: legacy::Error,
    },
    #[error("unsupported target {0}: only absolute http:// URLs can be forwarded")]
    UnsupportedTarget(String),
    #[error("HTTP exchange failed")]
    Http(#[from] legacy::Error),
}

/// Dials the TCP connections of the pooled client: the upstream proxy for
/// every URI when one is configured, the origin otherwise.
#[derive(Debug, Clone)]
pub struct OutboundConnector {
    upstream: Option<String>,
    connect_timeout: Duration,
    tcp_nodelay: bool,
}

impl OutboundConnector {
    fn address(&self, uri: &Uri) -> Result<String, ForwardError> {
        match self.upstream {
            Some(ref upstream) => Ok(upstream.clone()),
            None => origin_address(uri),
        }
    }
}

impl Service<Uri> for OutboundConnector {
    type Response = OutboundStream;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(async move {
            let address = connector
                .address(&uri)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let stream = dial(&address, connector.connect_timeout, connector.tcp_nodelay).await?;
            Ok(OutboundStream {
                io: TokioIo::new(stream),
                proxied: connector.upstream.is_some(),
            })
        })
    }
}

/// A pooled outbound connection.
pub struct OutboundStream {
    io: TokioIo<TcpStream>,
    proxied: bool,
}

impl Connection for OutboundStream {
    fn connected(&self) -> Connected {
        // Requests on proxied connections keep their absolute-form URI.
        Connected::new().proxy(self.proxied)
    }
}

impl Read for OutboundStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl Write for OutboundStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// Forwards plain HTTP requests, through the upstream proxy when one is
/// configured and straight to the origin otherwise. Outbound connections
/// are pooled and shared by every client connection.
#[derive(Clone)]
pub struct HttpForwarder {
    upstream: Option<String>,
    client: Client<OutboundConnector, Incoming>,
}

impl HttpForwarder {
    pub fn new(settings: &Settings) -> Self {
        let connector = OutboundConnector {
            upstream: settings.upstream_proxy.clone(),
            connect_timeout: settings.connect_timeout(),
            tcp_nodelay: settings.tcp_nodelay,
        };
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_timer(TokioTimer::new())
            .http1_preserve_header_case(true)
            .http1_title_case_headers(true)
            .build(connector);

        Self {
            upstream: settings.upstream_proxy.clone(),
            client,
        }
    }

    /// Performs one round trip. The response is handed back untouched, with
    /// its body still streaming from the outbound connection.
    pub async fn forward(&self, req: Request<Incoming>) -> Result<Response<Incoming>, ForwardError> {
        let address = match self.upstream {
            Some(ref upstream) => upstream.clone(),
            None => origin_address(req.uri())?,
        };

        self.client.request(req).await.map_err(|source| {
            if source.is_connect() {
                ForwardError::Dial { address, source }
            } else {
                ForwardError::Http(source)
            }
        })
    }
}

pub async fn handle_http(
    req: Request<Incoming>,
    ctx: RequestContext,
    forwarder: &HttpForwarder,
) -> Response<ProxyBody> {
    let url = req.uri().clone();
    info!("{} {} {:?} from {}", req.method(), url, req.version(), ctx.client_address);

    match forwarder.forward(req).await {
        Ok(resp) => resp.map(|body| body.boxed()),
        Err(e) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Failed to request {url}: {}", with_causes(&e)),
        ),
    }
}

/// `host:port` to dial for an absolute `http://` URI.
fn origin_address(uri: &Uri) -> Result<String, ForwardError> {
    match (uri.scheme_str(), uri.host()) {
        (Some("http"), Some(host)) => Ok(format!("{}:{}", host, uri.port_u16().unwrap_or(80))),
        _ => Err(ForwardError::UnsupportedTarget(uri.to_string())),
    }
}

fn with_causes(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut cause = error.source();
    while let Some(e) = cause {
        message.push_str(&format!(": {e}"));
        cause = e.source();
    }
    message
}
