use crate::proxy::{context::RequestContext, error_response, relay, Proxy, ProxyBody};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{body::Incoming, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tracing::{debug, error, info};

/// Handles a CONNECT request: opens the outbound leg, acknowledges the
/// client, then hands both raw streams to the relay once hyper releases the
/// client connection.
///
/// References:
/// - https://docs.rs/hyper/latest/hyper/upgrade/index.html
/// - https://github.com/hyperium/hyper/blob/master/examples/http_proxy.rs
pub async fn handle_connect(
    req: Request<Incoming>,
    ctx: RequestContext,
    proxy: &Proxy,
) -> Response<ProxyBody> {
    let version = format!("{:?}", req.version());
    info!("{} {} {} from {}", req.method(), req.uri(), version, ctx.client_address);

    let Some(target) = req.uri().authority().map(|a| a.to_string()) else {
        debug!("Invalid authority in CONNECT URI {}, terminating request", req.uri());
        return error_response(StatusCode::BAD_REQUEST, "CONNECT must be to a host:port authority".to_owned());
    };

    let upstream = match proxy.connector.connect(&target, &version).await {
        Ok(upstream) => upstream,
        Err(e) => {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Cannot connect to {target}: {e}"),
            );
        }
    };

    let idle_timeout = proxy.settings.idle_timeout();
    let connection_id = ctx.connection_id;
    tokio::task::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let tunnel = relay::spawn(&target, TokioIo::new(upgraded), upstream, idle_timeout);
                let stats = tunnel.join().await;
                debug!(
                    "Tunnel #{connection_id} to {target} closed: {} bytes sent, {} bytes received",
                    stats.client_to_upstream, stats.upstream_to_client
                );
            }
            // The 200 is already on the wire; all that is left is closing the outbound leg.
            Err(e) => error!("CONNECT upgrade to {target} failed after acknowledging: {e}"),
        }
    });

    Response::new(empty_body())
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}
