use std::env;
use std::os::fd::RawFd;
use std::collections::HashMap;
use std::os::unix::net::UnixDatagram;

use thiserror::Error;

const READY_MESSAGE: &str = "READY=1";
const SD_LISTEN_FDS_START: RawFd = 3;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Abstract notify socket {0} is not supported")]
    UnsupportedSocket(String),
    #[error("Failed to create an unbound UNIX domain socket: {0}")]
    FailedCreate(std::io::Error),
    #[error("Failed to connect to the systemd notify socket: {0}")]
    FailedConnect(std::io::Error),
    #[error("Failed to send a notification to the systemd notify socket: {0}")]
    FailedSend(std::io::Error)
}

/// Notify systemd about things. A no-op outside of a `Type=notify` unit.
pub fn sd_notify(state: &str) -> Result<(), NotifyError> {
    let Some(path) = env::var_os("NOTIFY_SOCKET") else {
        return Ok(());
    };
    if path.to_string_lossy().starts_with('@') {
        return Err(NotifyError::UnsupportedSocket(path.to_string_lossy().into_owned()));
    }

    let sock = UnixDatagram::unbound().map_err(NotifyError::FailedCreate)?;
    sock.connect(&path)
        .map_err(NotifyError::FailedConnect)?;

    sock
        .send(state.as_bytes())
        .map_err(NotifyError::FailedSend)?;

    Ok(())
}

#[inline]
pub fn sd_notify_ready() -> Result<(), NotifyError> {
    sd_notify(READY_MESSAGE)
}

/// Sockets passed by systemd socket activation, keyed by their
/// `FileDescriptorName=`.
pub fn listen_fds_named() -> HashMap<String, RawFd> {
    parse_listen_fds(
        std::process::id(),
        env::var("LISTEN_PID").ok().as_deref(),
        env::var("LISTEN_FDS").ok().as_deref(),
        env::var("LISTEN_FDNAMES").ok().as_deref(),
    )
}

fn parse_listen_fds(
    pid: u32,
    listen_pid: Option<&str>,
    listen_fds: Option<&str>,
    listen_fdnames: Option<&str>,
) -> HashMap<String, RawFd> {
    let pid_ok = listen_pid
        .and_then(|v| v.parse::<u32>().ok())
        .is_some_and(|v| v == pid);
    if !pid_ok {
        return HashMap::new();
    }

    let n_fds = listen_fds
        .and_then(|v| v.parse::<RawFd>().ok())
        .unwrap_or(0);

    // FDNAMES are colon-separated
    let names: Vec<&str> = listen_fdnames.map(|n| n.split(':').collect()).unwrap_or_default();

    (0..n_fds)
        .map(|i| {
            let fd = SD_LISTEN_FDS_START + i;
            let name = names
                .get(i as usize)
                .filter(|name| !name.is_empty())
                .map(|name| name.to_string())
                .unwrap_or_else(|| format!("fd{fd}"));
            (name, fd)
        })
        .collect()
}
