use crate::error::ResolutionError;
use hickory_resolver::proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_resolver::proto::rr::{Name, RData, RecordType};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

const MAX_RESPONSE: usize = 4096;

/// query_a asks one server for an A record over UDP
///
/// The socket is bound to `bind_ip` when it matches the server's family so
/// the query leaves through the egress interface.
pub async fn query_a(
    server: SocketAddr,
    hostname: &str,
    bind_ip: Option<IpAddr>,
    timeout: Duration,
) -> Result<Ipv4Addr, ResolutionError> {
    tokio::time::timeout(timeout, exchange(server, hostname, bind_ip))
        .await
        .map_err(|_| ResolutionError::Timeout(timeout.as_secs()))?
}

async fn exchange(
    server: SocketAddr,
    hostname: &str,
    bind_ip: Option<IpAddr>,
) -> Result<Ipv4Addr, ResolutionError> {
    let name = Name::from_ascii(hostname)
        .map_err(|_| ResolutionError::InvalidHostname(hostname.to_string()))?;

    let id: u16 = rand::random();
    let mut request = Message::new();
    request
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    request.add_query(Query::query(name, RecordType::A));
    let wire = request.to_vec().map_err(|e| server_error(server, e))?;

    let local = match (bind_ip, server) {
        (Some(ip @ IpAddr::V4(_)), SocketAddr::V4(_)) | (Some(ip @ IpAddr::V6(_)), SocketAddr::V6(_)) => ip,
        (_, SocketAddr::V4(_)) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        (_, SocketAddr::V6(_)) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let socket = UdpSocket::bind(SocketAddr::new(local, 0)).await?;
    socket.connect(server).await?;
    socket.send(&wire).await?;

    let mut buf = vec![0u8; MAX_RESPONSE];
    loop {
        let n = socket.recv(&mut buf).await?;
        let response = match Message::from_vec(&buf[..n]) {
            Ok(m) => m,
            Err(e) => {
                debug!(%server, "discarding undecodable dns response: {e}");
                continue;
            }
        };

        // Stray datagrams for other queries are ignored
        if response.id() != id || response.message_type() != MessageType::Response {
            continue;
        }

        if response.response_code() != ResponseCode::NoError {
            return Err(server_error(server, response.response_code()));
        }

        return response
            .answers()
            .iter()
            .find_map(|record| match record.data() {
                RData::A(a) => Some(a.0),
                _ => None,
            })
            .ok_or_else(|| ResolutionError::NoRecord(hostname.to_string()));
    }
}

fn server_error(server: SocketAddr, reason: impl std::fmt::Display) -> ResolutionError {
    ResolutionError::Server {
        server: server.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_resolver::proto::rr::Record;
    use hickory_resolver::proto::rr::rdata::A;

    /// answer_once serves a single canned reply from a local UDP socket
    async fn answer_once(code: ResponseCode, ip: Option<Ipv4Addr>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf[..n]).unwrap();

            let mut reply = Message::new();
            reply
                .set_id(request.id())
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query)
                .set_response_code(code);
            let query = request.queries()[0].clone();
            if let Some(ip) = ip {
                reply.add_answer(Record::from_rdata(query.name().clone(), 60, RData::A(A(ip))));
            }
            reply.add_query(query);
            socket.send_to(&reply.to_vec().unwrap(), peer).await.unwrap();
        });

        addr
    }

    #[tokio::test]
    async fn returns_first_a_record() {
        let ip = Ipv4Addr::new(93, 184, 216, 34);
        let server = answer_once(ResponseCode::NoError, Some(ip)).await;
        let got = query_a(server, "example.com", None, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(got, ip);
    }

    #[tokio::test]
    async fn error_rcode_fails() {
        let server = answer_once(ResponseCode::NXDomain, None).await;
        let err = query_a(server, "missing.example", None, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::Server { .. }));
    }

    #[tokio::test]
    async fn empty_answer_is_no_record() {
        let server = answer_once(ResponseCode::NoError, None).await;
        let err = query_a(server, "example.com", Some(IpAddr::V4(Ipv4Addr::LOCALHOST)), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::NoRecord(_)));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = socket.local_addr().unwrap();
        let err = query_a(server, "example.com", None, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::Timeout(_)));
        drop(socket);
    }
}
