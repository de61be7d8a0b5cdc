use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, warn};

/// How long an outbound connect may take
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// connect dials `target` from the egress address
///
/// A fixed egress port that is already taken falls back to an OS-assigned
/// port. The egress bind is skipped when its family differs from the target's.
pub async fn connect(egress: SocketAddr, target: SocketAddr) -> io::Result<TcpStream> {
    connect_timeout(egress, target, CONNECT_TIMEOUT).await
}

pub async fn connect_timeout(
    egress: SocketAddr,
    target: SocketAddr,
    timeout: Duration,
) -> io::Result<TcpStream> {
    let socket = bind_socket(egress, target)?;

    let stream = tokio::time::timeout(timeout, socket.connect(target))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {target} timed out after {}s", timeout.as_secs()),
            )
        })??;

    debug!(
        local = ?stream.local_addr().ok(),
        %target,
        "egress connection established"
    );
    Ok(stream)
}

fn new_socket(target: SocketAddr) -> io::Result<TcpSocket> {
    match target {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
}

fn bind_socket(egress: SocketAddr, target: SocketAddr) -> io::Result<TcpSocket> {
    let socket = new_socket(target)?;
    if egress.is_ipv4() != target.is_ipv4() {
        debug!(%egress, %target, "egress family mismatch, leaving socket unbound");
        return Ok(socket);
    }

    match socket.bind(egress) {
        Ok(()) => Ok(socket),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse && egress.port() != 0 => {
            warn!(%egress, "egress port in use, falling back to an ephemeral port");
            let socket = new_socket(target)?;
            socket.bind(SocketAddr::new(egress.ip(), 0))?;
            Ok(socket)
        }
        Err(e) => Err(e),
    }
}
