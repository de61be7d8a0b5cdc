use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Realm advertised in `Proxy-Authenticate`
pub const AUTH_REALM: &str = "Proxy Authentication Required";

/// Reply to a successful CONNECT
pub const CONNECTION_ESTABLISHED: &[u8] =
    b"HTTP/1.1 200 Connection established\r\nProxy-Connection: close\r\n\r\n";

/// error_response renders a closing plain-text error; `message` doubles as the reason phrase
pub fn error_response(code: u16, message: &str) -> Vec<u8> {
    let message = sanitize(message);
    let body = format!("Error {code}: {message}\r\n");
    format!(
        "HTTP/1.1 {code} {message}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
    .into_bytes()
}

/// proxy_auth_required renders the 407 challenge for HTTP Basic
pub fn proxy_auth_required() -> Vec<u8> {
    let body = "Proxy Authentication Required";
    format!(
        "HTTP/1.1 407 Proxy Authentication Required\r\n\
         Proxy-Authenticate: Basic realm=\"{AUTH_REALM}\"\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
    .into_bytes()
}

/// send_error writes an error response, ignoring a client that already left
pub async fn send_error<W>(writer: &mut W, code: u16, message: &str)
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = write_all_flush(writer, &error_response(code, message)).await {
        debug!(code, "client gone before error response: {e}");
    } else {
        debug!(code, message, "error response sent");
    }
}

/// send_auth_required writes the 407 challenge
pub async fn send_auth_required<W>(writer: &mut W)
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = write_all_flush(writer, &proxy_auth_required()).await {
        debug!("client gone before 407: {e}");
    }
}

async fn write_all_flush<W>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// sanitize keeps the reason phrase on one printable line
fn sanitize(message: &str) -> String {
    message
        .chars()
        .map(|c| if c.is_control() || !c.is_ascii() { '?' } else { c })
        .collect()
}
