use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Per inbound connection details carried into the handlers for logging.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub client_address: SocketAddr,
    pub connection_id: u64,
}

impl RequestContext {
    pub fn new(client_address: SocketAddr) -> Self {
        Self {
            client_address,
            connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}
