use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const RELAY_CHUNK_SIZE: usize = 8 * 1024;

/// How long an in-flight write may still take once the other direction has
/// closed the tunnel.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Last time any byte crossed the tunnel, in either direction.
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

/// The two relay tasks of an established tunnel.
pub struct Tunnel {
    outbound: JoinHandle<u64>,
    inbound: JoinHandle<u64>,
}

impl Tunnel {
    /// Waits for both directions to finish.
    pub async fn join(self) -> TunnelStats {
        TunnelStats {
            client_to_upstream: self.outbound.await.unwrap_or_default(),
            upstream_to_client: self.inbound.await.unwrap_or_default(),
        }
    }
}

/// Starts relaying bytes between `client` and `upstream`, one task per
/// direction. Whichever direction ends first closes the tunnel for both.
pub fn spawn<C, U>(name: &str, client: C, upstream: U, idle_timeout: Option<Duration>) -> Tunnel
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let closed = CancellationToken::new();
    let activity = Arc::new(Activity::new());

    let outbound = tokio::spawn(transfer(
        format!("{name} client"),
        client_read,
        upstream_write,
        closed.clone(),
        activity.clone(),
        idle_timeout,
    ));
    let inbound = tokio::spawn(transfer(
        format!("{name} server"),
        upstream_read,
        client_write,
        closed,
        activity,
        idle_timeout,
    ));

    Tunnel { outbound, inbound }
}

async fn transfer<R, W>(
    name: String,
    mut src: R,
    mut dst: W,
    closed: CancellationToken,
    activity: Arc<Activity>,
    idle_timeout: Option<Duration>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            read = read_chunk(&mut src, &mut buf, &activity, idle_timeout) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("{name}: read failed: {e}");
                    break;
                }
            }
        };

        tokio::select! {
            written = dst.write_all(&buf[..n]) => {
                if let Err(e) = written {
                    debug!("{name}: write failed: {e}");
                    break;
                }
            }
            _ = async {
                closed.cancelled().await;
                tokio::time::sleep(CLOSE_GRACE).await;
            } => break,
        }

        total += n as u64;
        activity.touch();
    }

    closed.cancel();
    let _ = dst.shutdown().await;
    debug!("{name} disconnected after {total} bytes");

    total
}

async fn read_chunk<R: AsyncRead + Unpin>(
    src: &mut R,
    buf: &mut [u8],
    activity: &Activity,
    idle_timeout: Option<Duration>,
) -> io::Result<usize> {
    let Some(idle_timeout) = idle_timeout else {
        return src.read(buf).await;
    };

    loop {
        let remaining = idle_timeout.saturating_sub(activity.idle_for());
        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "tunnel idle"));
        }
        // Reads are cancel safe, so timing out one loses nothing.
        if let Ok(read) = tokio::time::timeout(remaining, src.read(buf)).await {
            let n = read?;
            activity.touch();
            return Ok(n);
        }
    }
}
