//! Streaming Channel - one telemetry connection per run plus the handler list.
//!
//! Frames are decoded at the channel boundary and fanned out synchronously to
//! every registered handler in registration order. A handler that fails stops
//! the fan-out for that message; the remaining handlers do not see it.

use crate::error::{HandlerError, SyncError};
use crate::telemetry::TelemetryMessage;
use simwatch_env::{EnvError, FrameStream, StreamConnector};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Receives every decoded telemetry message.
pub trait MessageHandler: Send {
    fn handle(&mut self, message: &TelemetryMessage) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: FnMut(&TelemetryMessage) -> Result<(), HandlerError> + Send,
{
    fn handle(&mut self, message: &TelemetryMessage) -> Result<(), HandlerError> {
        self(message)
    }
}

/// An open connection and where it points.
struct Connection {
    id: Uuid,
    url: String,
    stream: Box<dyn FrameStream>,
}

/// Owns at most one open stream and the ordered handler list.
#[derive(Default)]
pub struct StreamingChannel {
    connection: Option<Connection>,
    handlers: Vec<Box<dyn MessageHandler>>,
}

impl StreamingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler; handlers run in the order they were added.
    pub fn register(&mut self, handler: impl MessageHandler + 'static) {
        self.handlers.push(Box::new(handler));
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Connects to `url`, closing any connection already open.
    pub async fn open<C>(&mut self, connector: &C, url: &str) -> Result<Uuid, EnvError>
    where
        C: StreamConnector + ?Sized,
    {
        self.close().await;

        let stream = connector.connect(url).await?;
        let id = Uuid::new_v4();
        info!("channel {} open: {}", id, url);
        self.connection = Some(Connection {
            id,
            url: url.to_string(),
            stream,
        });
        Ok(id)
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    /// URL of the open connection.
    pub fn url(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.url.as_str())
    }

    /// Waits for the next raw frame.
    ///
    /// `None` means there is no connection or the peer closed it; a
    /// transport error also ends the connection. Either way the channel is
    /// closed afterwards and `on_close` has run.
    pub async fn next_frame(&mut self) -> Option<String> {
        let connection = self.connection.as_mut()?;
        match connection.stream.next_frame().await {
            Some(Ok(frame)) => Some(frame),
            Some(Err(e)) => {
                warn!("channel {} broke: {}", connection.id, e);
                self.on_close();
                None
            }
            None => {
                self.on_close();
                None
            }
        }
    }

    /// Decodes a frame and hands it to every handler.
    ///
    /// Decode failures and handler failures are returned to the caller.
    pub fn on_message(&mut self, frame: &str) -> Result<TelemetryMessage, SyncError> {
        let message = TelemetryMessage::decode(frame)?;

        if let TelemetryMessage::Batch(event) = &message {
            debug!(
                "batch run={} agent={} t={}",
                event.run_id, event.raw_id, event.elapsed_time
            );
        }

        for (index, handler) in self.handlers.iter_mut().enumerate() {
            handler
                .handle(&message)
                .map_err(|source| SyncError::Handler { index, source })?;
        }

        Ok(message)
    }

    /// Forgets the connection after the peer closed it. No reconnect.
    fn on_close(&mut self) {
        if let Some(connection) = self.connection.take() {
            info!("channel {} closed: {}", connection.id, connection.url);
        }
    }

    /// Closes the connection from our side, if one is open.
    pub async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.stream.close().await {
                debug!("channel {} close: {}", connection.id, e);
            }
            info!("channel {} closed locally", connection.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct ScriptedStream {
        frames: VecDeque<Result<String, EnvError>>,
    }

    #[async_trait]
    impl FrameStream for ScriptedStream {
        async fn next_frame(&mut self) -> Option<Result<String, EnvError>> {
            self.frames.pop_front()
        }

        async fn close(&mut self) -> Result<(), EnvError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct ScriptedConnector {
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StreamConnector for ScriptedConnector {
        async fn connect(&self, url: &str) -> Result<Box<dyn FrameStream>, EnvError> {
            self.urls.lock().unwrap().push(url.to_string());
            Ok(Box::new(ScriptedStream {
                frames: VecDeque::from(vec![
                    Ok(r#"{"type":"hello"}"#.to_string()),
                    Err(EnvError::stream("reset")),
                ]),
            }))
        }
    }

    #[test]
    fn test_fan_out_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut channel = StreamingChannel::new();
        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            channel.register(move |m: &TelemetryMessage| -> Result<(), HandlerError> {
                seen.lock().unwrap().push((tag, m.kind().map(str::to_owned)));
                Ok(())
            });
        }

        channel.on_message(r#"{"type":"status"}"#).unwrap();

        let seen = seen.lock().unwrap();
        let order: Vec<&str> = seen.iter().map(|(tag, _)| *tag).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
        assert!(seen.iter().all(|(_, kind)| kind.as_deref() == Some("status")));
    }

    #[test]
    fn test_failing_handler_stops_fan_out() {
        let calls = Arc::new(Mutex::new(0));
        let mut channel = StreamingChannel::new();
        channel.register(|_: &TelemetryMessage| -> Result<(), HandlerError> { Err("boom".into()) });
        let later = Arc::clone(&calls);
        channel.register(move |_: &TelemetryMessage| -> Result<(), HandlerError> {
            *later.lock().unwrap() += 1;
            Ok(())
        });

        let err = channel.on_message(r#"{"type":"status"}"#).unwrap_err();

        assert!(matches!(err, SyncError::Handler { index: 0, .. }));
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_no_handlers_is_legal() {
        let mut channel = StreamingChannel::new();
        assert_eq!(channel.handler_count(), 0);
        assert!(channel.on_message(r#"{"type":"status"}"#).is_ok());
        assert!(matches!(channel.on_message("nope"), Err(SyncError::MalformedFrame(_))));
    }

    #[tokio::test]
    async fn test_stream_error_closes_channel() {
        let connector = ScriptedConnector::default();
        let mut channel = StreamingChannel::new();

        channel.open(&connector, "ws://sim/ws/1").await.unwrap();
        assert_eq!(channel.url(), Some("ws://sim/ws/1"));

        assert_eq!(channel.next_frame().await.as_deref(), Some(r#"{"type":"hello"}"#));
        assert!(channel.next_frame().await.is_none());
        assert!(!channel.is_open());
        assert!(channel.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_open_replaces_existing_connection() {
        let connector = ScriptedConnector::default();
        let mut channel = StreamingChannel::new();

        channel.open(&connector, "ws://sim/ws/1").await.unwrap();
        channel.open(&connector, "ws://sim/ws/2").await.unwrap();

        assert_eq!(channel.url(), Some("ws://sim/ws/2"));
        assert_eq!(connector.urls.lock().unwrap().len(), 2);
    }
}
