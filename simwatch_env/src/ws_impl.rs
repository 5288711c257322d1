//! Production stream connector backed by tokio-tungstenite.

use crate::error::EnvError;
use crate::transport::{FrameStream, StreamConnector};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

/// Opens WebSocket telemetry streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn FrameStream>, EnvError> {
        let (socket, _response) = connect_async(url)
            .await
            .map_err(|e| EnvError::stream(format!("connect {} failed: {}", url, e)))?;
        info!("stream connected: {}", url);

        Ok(Box::new(WsFrameStream {
            socket,
            url: url.to_string(),
        }))
    }
}

/// A connected WebSocket; yields text frames only.
struct WsFrameStream {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    url: String,
}

#[async_trait]
impl FrameStream for WsFrameStream {
    async fn next_frame(&mut self) -> Option<Result<String, EnvError>> {
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Close(frame))) => {
                    debug!("close frame from {}: {:?}", self.url, frame);
                    return None;
                }
                // Ping/pong are answered by tungstenite; binary frames carry no telemetry
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(EnvError::stream(e))),
                None => return None,
            }
        }
    }

    async fn close(&mut self) -> Result<(), EnvError> {
        self.socket.close(None).await.map_err(EnvError::stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_stream_yields_text_frames_until_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text(r#"{"type":"batch"}"#.to_string())).await.unwrap();
            ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
            ws.send(Message::Text(r#"{"type":"hello"}"#.to_string())).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let mut stream = WsConnector::new()
            .connect(&format!("ws://{}/ws/scenario/1", addr))
            .await
            .unwrap();

        assert_eq!(stream.next_frame().await.unwrap().unwrap(), r#"{"type":"batch"}"#);
        assert_eq!(stream.next_frame().await.unwrap().unwrap(), r#"{"type":"hello"}"#);
        assert!(stream.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_failure_is_stream_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = WsConnector::new().connect(&format!("ws://{}/ws", addr)).await;
        assert!(matches!(result, Err(EnvError::StreamError(_))));
    }
}
