//! Outbound request queue.
//!
//! Any task may append; only the connection driver drains. A write-pending
//! flag makes sure a burst of appends wakes the driver once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tds_protocol::packet::PacketType;
use tokio::sync::Notify;

use crate::pipeline::PipelineShared;

/// Work for the driver.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// A request message whose response feeds `pipeline`.
    Request {
        packet_type: PacketType,
        payload: Bytes,
        reset: bool,
        pipeline: Arc<PipelineShared>,
    },
    /// Cancel the latest request, in flight or still queued.
    Attention,
    /// Close the connection.
    Close,
}

impl Outbound {
    fn is_control(&self) -> bool {
        matches!(self, Self::Attention | Self::Close)
    }
}

/// A control item taken off the queue.
#[derive(Debug)]
pub(crate) enum Control {
    /// Cancel. `unsent` holds the requests queued ahead of the attention,
    /// which never reach the server; when empty the target is in flight.
    Attention { unsent: Vec<Arc<PipelineShared>> },
    Close,
}

#[derive(Debug)]
pub(crate) struct OutboundQueue {
    queue: Mutex<VecDeque<Outbound>>,
    write_pending: AtomicBool,
    wake: Arc<Notify>,
}

impl OutboundQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            write_pending: AtomicBool::new(false),
            wake: Arc::new(Notify::new()),
        }
    }

    /// The notifier that wakes the driver, shared with pipelines so that
    /// consumer demand wakes it too.
    pub(crate) fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Append work. The driver is notified only if no write was pending.
    pub(crate) fn push(&self, item: Outbound) {
        self.queue.lock().push_back(item);
        if !self.write_pending.swap(true, Ordering::AcqRel) {
            self.wake.notify_one();
        }
    }

    /// Start a drain pass. Appends after this point notify again.
    pub(crate) fn begin_drain(&self) {
        self.write_pending.store(false, Ordering::Release);
    }

    /// Take the first control item; control bypasses queued requests.
    ///
    /// An attention also takes the requests queued ahead of it. Requests
    /// queued after it are left alone.
    pub(crate) fn pop_control(&self) -> Option<Control> {
        let mut queue = self.queue.lock();
        let index = queue.iter().position(Outbound::is_control)?;
        match queue.remove(index)? {
            Outbound::Close => Some(Control::Close),
            _ => {
                let unsent = queue
                    .drain(..index)
                    .filter_map(|item| match item {
                        Outbound::Request { pipeline, .. } => Some(pipeline),
                        _ => None,
                    })
                    .collect();
                Some(Control::Attention { unsent })
            }
        }
    }

    /// Take the oldest request.
    pub(crate) fn pop_request(&self) -> Option<Outbound> {
        let mut queue = self.queue.lock();
        let index = queue.iter().position(|item| !item.is_control())?;
        queue.remove(index)
    }

    /// Remove everything still queued.
    pub(crate) fn drain(&self) -> Vec<Outbound> {
        self.queue.lock().drain(..).collect()
    }

    /// Wait for an append or for consumer demand.
    pub(crate) async fn notified(&self) {
        self.wake.notified().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    fn request(queue: &OutboundQueue) -> Outbound {
        Outbound::Request {
            packet_type: PacketType::SqlBatch,
            payload: Bytes::from_static(b"x"),
            reset: false,
            pipeline: PipelineShared::new(queue.wake_handle()),
        }
    }

    #[test]
    fn test_close_bypasses_requests() {
        let queue = OutboundQueue::new();
        queue.push(request(&queue));
        queue.push(Outbound::Close);

        assert!(matches!(queue.pop_control(), Some(Control::Close)));
        assert!(queue.pop_control().is_none());
        assert!(matches!(queue.pop_request(), Some(Outbound::Request { .. })));
        assert!(queue.pop_request().is_none());
    }

    #[test]
    fn test_attention_takes_requests_queued_ahead() {
        let queue = OutboundQueue::new();
        queue.push(request(&queue));
        queue.push(Outbound::Attention);

        assert!(matches!(
            queue.pop_control(),
            Some(Control::Attention { unsent }) if unsent.len() == 1
        ));
        assert!(queue.pop_request().is_none());
    }

    #[test]
    fn test_attention_leaves_later_requests() {
        let queue = OutboundQueue::new();
        queue.push(Outbound::Attention);
        queue.push(request(&queue));

        assert!(matches!(
            queue.pop_control(),
            Some(Control::Attention { unsent }) if unsent.is_empty()
        ));
        assert!(matches!(queue.pop_request(), Some(Outbound::Request { .. })));
    }

    #[test]
    fn test_single_notification_per_burst() {
        let queue = OutboundQueue::new();
        queue.push(Outbound::Attention);
        queue.push(Outbound::Close);

        // One stored permit for the burst.
        assert!(queue.notified().now_or_never().is_some());
        assert!(queue.notified().now_or_never().is_none());

        queue.begin_drain();
        assert_eq!(queue.drain().len(), 2);
        queue.push(Outbound::Close);
        assert!(queue.notified().now_or_never().is_some());
    }
}
