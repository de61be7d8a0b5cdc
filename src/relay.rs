use crate::capabilities::StatsSession;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Connections with no traffic in either direction for this long are closed
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest chunk moved per read
pub const CHUNK_SIZE: usize = 4096;

/// RelayTotals counts the bytes moved by one relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayTotals {
    pub to_client: u64,
    pub from_client: u64,
}

/// relay pumps bytes both ways until EOF on either side, an error, or `idle` passes
///
/// Every chunk is reported to `stats` as it is written. Both write halves are
/// shut down on exit.
pub async fn relay<C, U>(
    client: &mut C,
    upstream: &mut U,
    stats: Option<&StatsSession>,
    idle: Duration,
) -> io::Result<RelayTotals>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let mut totals = RelayTotals::default();
    let mut client_buf = vec![0u8; CHUNK_SIZE];
    let mut upstream_buf = vec![0u8; CHUNK_SIZE];

    let result = loop {
        tokio::select! {
            read = client.read(&mut client_buf) => {
                let n = match read {
                    Ok(0) => break Ok(()),
                    Ok(n) => n,
                    Err(e) => break Err(e),
                };
                if let Err(e) = upstream.write_all(&client_buf[..n]).await {
                    break Err(e);
                }
                totals.from_client += n as u64;
                if let Some(stats) = stats {
                    stats.traffic(0, n as u64);
                }
            }
            read = upstream.read(&mut upstream_buf) => {
                let n = match read {
                    Ok(0) => break Ok(()),
                    Ok(n) => n,
                    Err(e) => break Err(e),
                };
                if let Err(e) = client.write_all(&upstream_buf[..n]).await {
                    break Err(e);
                }
                totals.to_client += n as u64;
                if let Some(stats) = stats {
                    stats.traffic(n as u64, 0);
                }
            }
            _ = tokio::time::sleep(idle) => {
                debug!(idle_secs = idle.as_secs(), "relay idle timeout");
                break Ok(());
            }
        }
    };

    let _ = upstream.shutdown().await;
    let _ = client.shutdown().await;

    debug!(
        to_client = totals.to_client,
        from_client = totals.from_client,
        "relay finished"
    );
    result.map(|_| totals)
}
