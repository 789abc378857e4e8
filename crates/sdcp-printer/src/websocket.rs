//! WebSocket control channel and candidate negotiation.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{Result, SdcpError};
use crate::router::{FrameRouter, InboundFrame};
use crate::transport::{Connection, Transport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on the close handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// WebSocket variant of [`Transport`].
pub struct WebSocketTransport {
    uri: String,
    sink: Mutex<SplitSink<WsStream, Message>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn endpoint(&self) -> String {
        self.uri.clone()
    }

    async fn send_frame(&self, text: String) -> Result<()> {
        self.sink.lock().await.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn shutdown(&self) {
        let close = async { self.sink.lock().await.close().await };
        match tokio::time::timeout(CLOSE_TIMEOUT, close).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(uri = %self.uri, "close handshake failed: {e}"),
            Err(_) => tracing::warn!(uri = %self.uri, "close handshake did not finish in time"),
        }
    }
}

/// Build the URI for one candidate.
pub fn candidate_uri(ip: IpAddr, port: u16, path: &str) -> String {
    let addr = SocketAddr::new(ip, port);
    if path.starts_with('/') {
        format!("ws://{addr}{path}")
    } else {
        format!("ws://{addr}/{path}")
    }
}

/// Try every (port, path) pair in order and open the first that completes its handshake.
///
/// Ports are the outer loop. Probing stops at the first success.
pub async fn connect(
    ip: IpAddr,
    ports: &[u16],
    paths: &[String],
    handshake_timeout: Duration,
) -> Result<Connection> {
    let mut attempts = 0;
    let mut last_error = None;

    for &port in ports {
        for path in paths {
            let uri = candidate_uri(ip, port, path);
            attempts += 1;
            tracing::info!(%uri, "connecting to SDCP WebSocket");

            match tokio::time::timeout(handshake_timeout, connect_async(uri.as_str())).await {
                Ok(Ok((stream, _response))) => return Ok(open(uri, stream)),
                Ok(Err(e)) => {
                    tracing::warn!(%uri, "WebSocket connect failed: {e}");
                    last_error = Some(SdcpError::from(e));
                }
                Err(_) => {
                    tracing::warn!(%uri, "WebSocket handshake timed out");
                    last_error = Some(SdcpError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no handshake from {uri} within {handshake_timeout:?}"),
                    )));
                }
            }
        }
    }

    Err(SdcpError::Handshake {
        attempts,
        source: last_error.map(Box::new),
    })
}

fn open(uri: String, stream: WsStream) -> Connection {
    tracing::info!(%uri, "SDCP WebSocket connected");
    let (sink, stream) = stream.split();
    let router = FrameRouter::new();
    let reader = tokio::spawn(read_frames(stream, Arc::clone(&router), uri.clone()));

    let transport = WebSocketTransport {
        uri,
        sink: Mutex::new(sink),
    };
    Connection::new(Box::new(transport), router, vec![reader])
}

async fn read_frames(mut stream: SplitStream<WsStream>, router: Arc<FrameRouter>, uri: String) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                router.route(InboundFrame::text(text));
            }
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => {
                    router.route(InboundFrame::text(text));
                }
                Err(_) => tracing::debug!(%uri, "dropping non-UTF-8 binary frame"),
            },
            Ok(Message::Close(frame)) => {
                tracing::info!(%uri, ?frame, "printer closed the WebSocket");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(%uri, "WebSocket read failed: {e}");
                break;
            }
        }
    }
    tracing::debug!(%uri, "frame reader stopped");
    router.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_uri() {
        let ip: IpAddr = "192.168.1.50".parse().unwrap();
        assert_eq!(
            candidate_uri(ip, 3030, "/websocket"),
            "ws://192.168.1.50:3030/websocket"
        );
        assert_eq!(candidate_uri(ip, 3031, "ws"), "ws://192.168.1.50:3031/ws");

        let v6: IpAddr = "::1".parse().unwrap();
        assert_eq!(candidate_uri(v6, 3030, "/"), "ws://[::1]:3030/");
    }

    #[tokio::test]
    async fn test_all_candidates_fail() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect(
            "127.0.0.1".parse().unwrap(),
            &[port],
            &["/websocket".into(), "/ws".into()],
            Duration::from_secs(1),
        )
        .await
        .err()
        .unwrap();

        match err {
            SdcpError::Handshake { attempts, source } => {
                assert_eq!(attempts, 2);
                assert!(source.is_some());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_close_is_bounded_when_peer_stops_reading() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            std::future::pending::<()>().await;
        });

        let candidate = connect(
            "127.0.0.1".parse().unwrap(),
            &[port],
            &["/".into()],
            Duration::from_secs(2),
        )
        .await;
        let connection = match candidate {
            Ok(connection) => Arc::new(connection),
            Err(e) => panic!("connect failed: {e}"),
        };

        // A frame larger than the socket buffers blocks while holding the sink.
        let writer = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                let blob = "G1 X0\n".repeat(6 * 1024 * 1024);
                let envelope = crate::protocol::Envelope::new(0, serde_json::json!({ "Blob": blob }), None);
                let _ = connection.send_request(&envelope, Duration::from_secs(60)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;

        let closed = tokio::time::timeout(CLOSE_TIMEOUT * 3, connection.close()).await;
        assert!(closed.is_ok(), "close did not return");
        writer.abort();
    }
}
