//! Inbound frame demultiplexing.
//!
//! Every transport feeds its inbound frames into one [`FrameRouter`]. Frames
//! carrying the status topic marker go to the [`StatusQueue`]; everything
//! else is matched against the [`PendingTable`] by correlation id.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};

use crate::error::{Result, SdcpError};
use crate::protocol::{is_status_frame, response_request_id, STATUS_TOPIC_PREFIX};

/// Correlation id → result slot.
///
/// Once [`PendingTable::reject_all`] has run the table is closed: further
/// registrations fail with `NotConnected`.
#[derive(Debug)]
pub struct PendingTable {
    slots: Mutex<Option<HashMap<String, oneshot::Sender<Value>>>>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self {
            slots: Mutex::new(Some(HashMap::new())),
        }
    }
}

impl PendingTable {
    /// Register a slot for `request_id`. Fails if one is already waiting.
    pub fn register(&self, request_id: &str) -> Result<oneshot::Receiver<Value>> {
        let mut guard = self.slots.lock();
        let slots = guard.as_mut().ok_or(SdcpError::NotConnected)?;
        if slots.contains_key(request_id) {
            return Err(SdcpError::DuplicateRequestId(request_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        slots.insert(request_id.to_string(), tx);
        Ok(rx)
    }

    /// Resolve and remove the slot for `request_id`.
    ///
    /// Returns `false` when no slot is waiting, so a second resolution is a no-op.
    pub fn complete(&self, request_id: &str, response: Value) -> bool {
        let Some(tx) = self.take(request_id) else {
            return false;
        };
        // The waiter may have given up between removal and send.
        tx.send(response).is_ok()
    }

    /// Drop the slot for `request_id` without resolving it.
    pub fn remove(&self, request_id: &str) -> bool {
        self.take(request_id).is_some()
    }

    fn take(&self, request_id: &str) -> Option<oneshot::Sender<Value>> {
        self.slots.lock().as_mut()?.remove(request_id)
    }

    /// Close the table and drop every slot; waiters observe a closed channel.
    pub fn reject_all(&self) -> usize {
        self.slots.lock().take().map_or(0, |slots| slots.len())
    }

    /// Number of waiting slots.
    pub fn len(&self) -> usize {
        self.slots.lock().as_ref().map_or(0, HashMap::len)
    }

    /// Whether no slot is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes a pending slot when the waiting call ends, however it ends.
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingTable,
    request_id: String,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(table: &'a PendingTable, request_id: &str) -> Self {
        Self {
            table,
            request_id: request_id.to_string(),
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.request_id);
    }
}

/// Unbounded FIFO of unsolicited status messages.
#[derive(Debug, Default)]
pub struct StatusQueue {
    items: Mutex<VecDeque<Value>>,
    notify: Notify,
    closed: AtomicBool,
}

impl StatusQueue {
    /// Append a message. Never blocks; ignored once the queue is closed.
    pub fn push(&self, status: Value) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.items.lock().push_back(status);
        self.notify.notify_one();
    }

    /// Take the oldest message without waiting.
    pub fn try_pop(&self) -> Option<Value> {
        self.items.lock().pop_front()
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// Returns `Ok(None)` on timeout and `NotConnected` once the queue is closed.
    pub async fn pop(&self, timeout: Duration) -> Result<Option<Value>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_pop() {
                return Ok(Some(status));
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(SdcpError::NotConnected);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(self.try_pop());
            }
        }
    }

    /// Discard queued messages, keeping the queue open. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let dropped = items.len();
        items.clear();
        dropped
    }

    /// Discard queued messages and wake every waiter.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.items.lock().clear();
        self.notify.notify_waiters();
        // Covers a waiter that checked `closed` but has not registered yet.
        self.notify.notify_one();
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// A frame handed to the router by a transport.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Broker topic the frame arrived on (MQTT only).
    pub topic: Option<String>,
    /// Frame text.
    pub text: String,
}

impl InboundFrame {
    /// A frame with no broker topic.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            topic: None,
            text: text.into(),
        }
    }
}

/// Where the router sent a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Appended to the status queue.
    Status,
    /// Resolved a pending request.
    Response,
    /// Dropped (malformed, unmatched or late).
    Dropped,
}

/// Demultiplexes inbound frames.
#[derive(Debug, Default)]
pub struct FrameRouter {
    pending: PendingTable,
    status: StatusQueue,
}

impl FrameRouter {
    /// Create a router with an empty table and queue.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pending-request table.
    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Status queue.
    pub fn status(&self) -> &StatusQueue {
        &self.status
    }

    /// Route one frame.
    pub fn route(&self, frame: InboundFrame) -> Routed {
        let value: Value = match serde_json::from_str(&frame.text) {
            Ok(value @ Value::Object(_)) => value,
            _ => {
                tracing::debug!(len = frame.text.len(), "dropping malformed frame");
                return Routed::Dropped;
            }
        };

        let on_status_topic = frame
            .topic
            .as_deref()
            .is_some_and(|topic| topic.contains(STATUS_TOPIC_PREFIX));
        if on_status_topic || is_status_frame(&value) {
            self.status.push(value);
            return Routed::Status;
        }

        let Some(request_id) = response_request_id(&value).map(str::to_owned) else {
            tracing::debug!("dropping frame without request id");
            return Routed::Dropped;
        };
        if self.pending.complete(&request_id, value) {
            Routed::Response
        } else {
            tracing::debug!(%request_id, "dropping unmatched response");
            Routed::Dropped
        }
    }

    /// Reject every pending request and discard queued status.
    pub fn shutdown(&self) {
        let rejected = self.pending.reject_all();
        if rejected > 0 {
            tracing::debug!(rejected, "rejected pending requests on close");
        }
        self.status.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(id: &str) -> InboundFrame {
        InboundFrame::text(
            json!({"Topic": "sdcp/response/B", "Data": {"Cmd": 0, "RequestID": id}}).to_string(),
        )
    }

    #[tokio::test]
    async fn test_response_resolves_once() {
        let router = FrameRouter::new();
        let rx = router.pending().register("req-1").unwrap();
        assert_eq!(router.pending().len(), 1);

        assert_eq!(router.route(response("req-1")), Routed::Response);
        assert_eq!(router.route(response("req-1")), Routed::Dropped);
        assert!(router.pending().is_empty());

        let value = rx.await.unwrap();
        assert_eq!(value["Data"]["RequestID"], "req-1");
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let table = PendingTable::default();
        let _rx = table.register("dup").unwrap();
        assert!(matches!(
            table.register("dup"),
            Err(SdcpError::DuplicateRequestId(_))
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_guard_removes_slot() {
        let table = PendingTable::default();
        let _rx = table.register("guarded").unwrap();
        {
            let _guard = PendingGuard::new(&table, "guarded");
        }
        assert!(table.is_empty());
        assert!(!table.complete("guarded", json!({})));
    }

    #[test]
    fn test_status_and_noise() {
        let router = FrameRouter::new();

        let status = json!({"Topic": "sdcp/status/B", "Status": {"CurrentStatus": [0]}});
        assert_eq!(
            router.route(InboundFrame::text(status.to_string())),
            Routed::Status
        );
        assert_eq!(router.route(InboundFrame::text("not json")), Routed::Dropped);
        assert_eq!(router.route(InboundFrame::text("[1, 2]")), Routed::Dropped);
        assert_eq!(router.route(response("nobody")), Routed::Dropped);
        assert_eq!(router.status().len(), 1);
    }

    #[test]
    fn test_broker_status_topic() {
        let router = FrameRouter::new();
        let frame = InboundFrame {
            topic: Some("/sdcp/status/B".into()),
            text: json!({"Status": {}}).to_string(),
        };
        assert_eq!(router.route(frame), Routed::Status);
    }

    #[tokio::test]
    async fn test_status_fifo() {
        let queue = StatusQueue::default();
        for n in 0..3 {
            queue.push(json!({ "n": n }));
        }
        for n in 0..3 {
            let item = queue.pop(Duration::from_millis(10)).await.unwrap().unwrap();
            assert_eq!(item["n"], n);
        }
        assert!(queue.pop(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_keeps_queue_open() {
        let queue = StatusQueue::default();
        queue.push(json!({ "n": 0 }));
        queue.push(json!({ "n": 1 }));

        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());

        queue.push(json!({ "n": 2 }));
        let item = queue.pop(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(item["n"], 2);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let router = FrameRouter::new();
        let waiter = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.status().pop(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        router.status().push(json!({"late": true}));

        let item = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(item["late"], true);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_and_drains() {
        let router = FrameRouter::new();
        let rx = router.pending().register("left-behind").unwrap();
        router.status().push(json!({}));

        router.shutdown();

        assert!(rx.await.is_err());
        assert!(router.pending().is_empty());
        assert!(matches!(
            router.pending().register("too-late"),
            Err(SdcpError::NotConnected)
        ));
        assert!(router.status().is_empty());
        assert!(matches!(
            router.status().pop(Duration::from_millis(10)).await,
            Err(SdcpError::NotConnected)
        ));
    }
}
