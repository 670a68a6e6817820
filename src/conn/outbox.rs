//! Outbound frame queue shared by every stream of a connection.
//!
//! Frames are FIFO per stream and handed to the writer pump round-robin
//! across streams, so one stream sending a large message cannot starve the
//! others.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit};

use crate::types::{Error, Result, StreamId};
use crate::wire::Frame;

/// A queued frame. Holds the sending stream's credit until written.
#[derive(Debug)]
pub(crate) struct Outgoing {
    pub(crate) frame: Frame,
    _credit: Option<OwnedSemaphorePermit>,
}

#[derive(Debug, Default)]
struct Queues {
    pending: HashMap<StreamId, VecDeque<Outgoing>>,
    /// Streams with pending frames, in service order.
    ready: VecDeque<StreamId>,
    len: usize,
    closed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Outbox {
    queues: Mutex<Queues>,
    notify: Notify,
}

impl Outbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, frame: Frame, credit: Option<OwnedSemaphorePermit>) -> Result<()> {
        {
            let mut queues = self.queues.lock();
            if queues.closed {
                return Err(Error::connection_closed("connection closed"));
            }
            let Queues {
                pending,
                ready,
                len,
                ..
            } = &mut *queues;
            let id = frame.stream_id;
            let queue = pending.entry(id).or_default();
            if queue.is_empty() {
                ready.push_back(id);
            }
            queue.push_back(Outgoing {
                frame,
                _credit: credit,
            });
            *len += 1;
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Take the next frame in round-robin order.
    pub(crate) fn pop(&self) -> Option<Outgoing> {
        let mut queues = self.queues.lock();
        let Queues {
            pending,
            ready,
            len,
            ..
        } = &mut *queues;
        let id = ready.pop_front()?;
        let queue = pending.get_mut(&id)?;
        let item = queue.pop_front();
        if queue.is_empty() {
            pending.remove(&id);
        } else {
            ready.push_back(id);
        }
        if item.is_some() {
            *len -= 1;
        }
        item
    }

    /// Wait for the next frame. `None` once the outbox is closed.
    pub(crate) async fn next(&self) -> Option<Outgoing> {
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            if self.queues.lock().closed {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Reject further frames and drop the queued ones.
    pub(crate) fn close(&self) {
        {
            let mut queues = self.queues.lock();
            queues.closed = true;
            queues.pending.clear();
            queues.ready.clear();
            queues.len = 0;
        }
        self.notify.notify_one();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queues.lock().len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::FrameKind;
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::sync::Semaphore;
    use tokio_test::{assert_pending, assert_ready, task};

    fn data(id: u32, tag: &'static str) -> Frame {
        Frame::new(StreamId::new(id), FrameKind::MessageData, Bytes::from_static(tag.as_bytes()))
    }

    fn drain(outbox: &Outbox) -> Vec<String> {
        let mut tags = Vec::new();
        while let Some(item) = outbox.pop() {
            tags.push(String::from_utf8_lossy(&item.frame.payload).into_owned());
        }
        tags
    }

    #[test]
    fn streams_are_served_round_robin() {
        let outbox = Outbox::new();
        for (id, tag) in [(1, "a1"), (1, "a2"), (1, "a3"), (2, "b1"), (2, "b2"), (3, "c1")] {
            outbox.push(data(id, tag), None).unwrap();
        }
        assert_eq!(drain(&outbox), vec!["a1", "b1", "c1", "a2", "b2", "a3"]);
        assert!(outbox.is_empty());
    }

    #[test]
    fn closed_outbox_rejects_and_drops() {
        let outbox = Outbox::new();
        outbox.push(data(1, "a1"), None).unwrap();
        outbox.close();
        assert!(outbox.is_empty());
        assert!(outbox.pop().is_none());
        let err = outbox.push(data(1, "a2"), None).unwrap_err();
        assert!(err.is_canceled());
    }

    #[test]
    fn credits_return_when_frames_are_taken() {
        let credits = Arc::new(Semaphore::new(1));
        let outbox = Outbox::new();
        let permit = credits.clone().try_acquire_owned().unwrap();
        outbox.push(data(1, "a1"), Some(permit)).unwrap();
        assert_eq!(credits.available_permits(), 0);

        drop(outbox.pop());
        assert_eq!(credits.available_permits(), 1);
    }

    #[test]
    fn next_wakes_on_push_and_close() {
        let outbox = Outbox::new();

        let mut next = task::spawn(outbox.next());
        assert_pending!(next.poll());
        outbox.push(data(4, "a1"), None).unwrap();
        assert!(next.is_woken());
        let first = assert_ready!(next.poll()).map(|o| o.frame.stream_id);
        assert_eq!(first, Some(StreamId::new(4)));

        let mut next = task::spawn(outbox.next());
        assert_pending!(next.poll());
        outbox.close();
        assert!(next.is_woken());
        assert!(assert_ready!(next.poll()).is_none());
    }
}
