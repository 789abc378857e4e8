//! Transport abstraction shared by the WebSocket and MQTT channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::error::{Result, SdcpError};
use crate::protocol::Envelope;
use crate::router::{FrameRouter, PendingGuard, StatusQueue};

/// Outbound half of an open control channel.
///
/// Inbound frames never pass through this trait: each transport feeds them
/// into the connection's [`FrameRouter`] from its own reader.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable endpoint, e.g. `ws://192.168.1.50:3030/websocket`.
    fn endpoint(&self) -> String;

    /// Send one request frame.
    async fn send_frame(&self, text: String) -> Result<()>;

    /// Release the underlying socket or broker session.
    async fn shutdown(&self);
}

/// One open control channel together with its router and reader tasks.
pub struct Connection {
    transport: Box<dyn Transport>,
    router: Arc<FrameRouter>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Wrap a transport whose reader tasks feed `router`.
    pub fn new(
        transport: Box<dyn Transport>,
        router: Arc<FrameRouter>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            transport,
            router,
            tasks: Mutex::new(tasks),
        }
    }

    /// Endpoint of the underlying transport.
    pub fn endpoint(&self) -> String {
        self.transport.endpoint()
    }

    /// Send `envelope` and wait up to `timeout` for the response carrying its correlation id.
    ///
    /// The pending slot is removed when this call returns or is dropped. A
    /// timed-out request is only abandoned locally.
    pub async fn send_request(&self, envelope: &Envelope, timeout: Duration) -> Result<Value> {
        let pending = self.router.pending();
        let rx = pending.register(envelope.request_id())?;
        let _guard = PendingGuard::new(pending, envelope.request_id());

        tracing::debug!(
            cmd = envelope.code(),
            request_id = envelope.request_id(),
            "sending command"
        );
        self.transport.send_frame(envelope.to_json_string()?).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(SdcpError::ConnectionClosed),
            Err(_) => Err(SdcpError::CommandTimeout {
                code: envelope.code(),
                timeout,
            }),
        }
    }

    /// Queue of unsolicited status messages.
    pub fn status_queue(&self) -> &StatusQueue {
        self.router.status()
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.router.pending().len()
    }

    /// Stop the reader tasks, reject pending requests and release the transport.
    pub async fn close(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
        self.router.shutdown();
        self.transport.shutdown().await;
        tracing::info!(endpoint = %self.endpoint(), "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
