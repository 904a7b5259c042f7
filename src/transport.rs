//! Framed request/reply transport for device control.
//!
//! One connection carries a sequence of independent exchanges: the server
//! reads a frame, hands the decoded request to the handler, writes the framed
//! reply, and waits for the next frame or EOF. The client helper walks a list
//! of candidate addresses (a device may advertise several) until one accepts.

use crate::command::{CommandRequest, CommandResponse, ErrorDetails};
use crate::wire::{self, MULTICAST_ADDR, MULTICAST_PORT, WireError};
use std::io;
use std::net::Ipv4Addr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Upper bound on a single framed exchange in either direction.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no address out of {attempted} accepted a connection on port {port}")]
    NoRoute { port: u16, attempted: usize },
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

/// Accepts connections forever, serving each on its own task.
///
/// The handler is an async function from request to response. Handler-level
/// failures are expected to come back as [`CommandResponse::Error`]; only
/// undecodable input is converted to an error reply here.
pub async fn serve<H, Fut>(listener: TcpListener, handler: H) -> io::Result<()>
where
    H: Fn(CommandRequest) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = CommandResponse> + Send + 'static,
{
    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "control connection accepted");
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, handler).await {
                debug!(%peer, error = %e, "control connection ended with error");
            }
            debug!(%peer, "control connection closed");
        });
    }
}

async fn handle_connection<H, Fut>(mut stream: TcpStream, handler: H) -> io::Result<()>
where
    H: Fn(CommandRequest) -> Fut,
    Fut: Future<Output = CommandResponse> + Send + 'static,
{
    let mut buf = vec![0u8; MAX_FRAME_BYTES];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        debug!(bytes = n, "control request received");

        // The handler runs on its own task so a panicking device
        // implementation degrades to an in-band error instead of a dropped
        // connection.
        let response = match decode_request(&buf[..n]) {
            Ok(request) => match tokio::spawn(handler(request)).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "control handler failed");
                    CommandResponse::Error(ErrorDetails::unknown(e.to_string()))
                }
            },
            Err(e) => {
                warn!(error = %e, "undecodable control request");
                CommandResponse::Error(ErrorDetails::unknown(e.to_string()))
            }
        };

        let reply = match wire::frame(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode control reply");
                continue;
            }
        };
        stream.write_all(&reply).await?;
        stream.flush().await?;
        debug!(bytes = reply.len(), "control reply sent");
    }
}

fn decode_request(data: &[u8]) -> Result<CommandRequest, WireError> {
    wire::decode(wire::unframe(data)?)
}

/// Sends one framed request, trying `addresses` in order.
///
/// Addresses that refuse or fail the connection are skipped; once a
/// connection is established, any later failure is returned as-is. The
/// reply's raw payload bytes are handed back for the caller to decode.
pub async fn send_request(
    addresses: &[String],
    port: u16,
    request: &CommandRequest,
) -> Result<Vec<u8>, TransportError> {
    let frame = wire::frame(request)?;

    for address in addresses {
        let mut stream = match TcpStream::connect((address.as_str(), port)).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%address, port, error = %e, "connect failed, trying next address");
                continue;
            }
        };
        info!(%address, port, "connected to device endpoint");

        stream.write_all(&frame).await?;
        stream.flush().await?;

        let mut buf = vec![0u8; MAX_FRAME_BYTES];
        let n = stream.read(&mut buf).await?;
        let payload = wire::unframe(&buf[..n])?;
        return Ok(payload.to_vec());
    }

    Err(TransportError::NoRoute {
        port,
        attempted: addresses.len(),
    })
}

/// Binds a listener on an OS-assigned port and reports the port back.
pub async fn bind_ephemeral() -> io::Result<(TcpListener, u16)> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

/// Best-effort local IPv4 discovery: the source address the OS would pick to
/// reach the discovery group. Falls back to loopback on hosts with no route.
pub fn local_ipv4_addresses() -> Vec<String> {
    fn probe() -> io::Result<String> {
        let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((MULTICAST_ADDR, MULTICAST_PORT))?;
        Ok(socket.local_addr()?.ip().to_string())
    }
    match probe() {
        Ok(ip) if ip != "0.0.0.0" => vec![ip],
        _ => vec!["127.0.0.1".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ActuatorAction, ErrorCode, SinkAction};

    async fn spawn_echo_server() -> u16 {
        let (listener, port) = bind_ephemeral().await.unwrap();
        tokio::spawn(serve(listener, |request: CommandRequest| async move {
            let CommandRequest::SendActuatorCommand { device_id, .. } = request;
            CommandResponse::ActuatorAck {
                message: format!("seen {device_id}"),
            }
        }));
        port
    }

    fn sink_request() -> CommandRequest {
        CommandRequest::SendActuatorCommand {
            device_id: "Kitchen._sink._tcp.local.".into(),
            action: ActuatorAction::Sink(SinkAction { turn_on: true }),
        }
    }

    #[tokio::test]
    async fn round_trip() {
        let port = spawn_echo_server().await;
        let payload = send_request(&["127.0.0.1".into()], port, &sink_request())
            .await
            .unwrap();
        let response: CommandResponse = wire::decode(&payload).unwrap();
        assert_eq!(
            response,
            CommandResponse::ActuatorAck {
                message: "seen Kitchen._sink._tcp.local.".into()
            }
        );
    }

    #[tokio::test]
    async fn dead_addresses_are_skipped() {
        let port = spawn_echo_server().await;
        // 127.0.0.2 has nothing listening; the client must fall through.
        let payload = send_request(
            &["127.0.0.2".into(), "127.0.0.1".into()],
            port,
            &sink_request(),
        )
        .await
        .unwrap();
        let response: CommandResponse = wire::decode(&payload).unwrap();
        assert!(matches!(response, CommandResponse::ActuatorAck { .. }));
    }

    #[tokio::test]
    async fn exhausted_addresses_yield_no_route() {
        // Grab a port and close the listener so nothing serves it.
        let (listener, port) = bind_ephemeral().await.unwrap();
        drop(listener);
        let err = send_request(&["127.0.0.1".into()], port, &sink_request())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NoRoute { attempted: 1, .. }));
    }

    #[tokio::test]
    async fn panicking_handler_degrades_to_error_reply() {
        async fn exploding(_request: CommandRequest) -> CommandResponse {
            panic!("device bug")
        }

        let (listener, port) = bind_ephemeral().await.unwrap();
        tokio::spawn(serve(listener, exploding));

        let payload = send_request(&["127.0.0.1".into()], port, &sink_request())
            .await
            .unwrap();
        let response: CommandResponse = wire::decode(&payload).unwrap();
        match response {
            CommandResponse::Error(details) => assert_eq!(details.code, ErrorCode::Unknown),
            other => panic!("expected error reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_frame_gets_unknown_error_reply() {
        let port = spawn_echo_server().await;
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        // Valid length prefix, nonsense payload.
        let mut junk = (7u32).to_be_bytes().to_vec();
        junk.extend_from_slice(&[0xFF; 7]);
        stream.write_all(&junk).await.unwrap();
        stream.flush().await.unwrap();

        let mut buf = vec![0u8; MAX_FRAME_BYTES];
        let n = stream.read(&mut buf).await.unwrap();
        let response: CommandResponse = wire::decode(wire::unframe(&buf[..n]).unwrap()).unwrap();
        match response {
            CommandResponse::Error(details) => assert_eq!(details.code, ErrorCode::Unknown),
            other => panic!("expected error reply, got {other:?}"),
        }
    }
}
