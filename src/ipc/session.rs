//! Pending-call bookkeeping for one worker.
//!
//! Session ids come from a counter shared by every worker, so an id is never
//! reused while any worker could still answer it. A reply whose session is no
//! longer known is dropped silently.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use super::protocol::{Reply, WireError};
use crate::envelope::{Body, BodyStream, Response, StreamSender};

/// Outcome delivered to the caller of a session.
pub type SessionResult = std::result::Result<Reply, WireError>;

#[derive(Debug)]
pub struct SessionTable {
    counter: Arc<AtomicU64>,
    pending: HashMap<u64, oneshot::Sender<SessionResult>>,
    streams: HashMap<u64, StreamSender>,
}

impl SessionTable {
    pub fn new(counter: Arc<AtomicU64>) -> Self {
        Self {
            counter,
            pending: HashMap::new(),
            streams: HashMap::new(),
        }
    }

    /// Allocate a session id and register its reply slot.
    pub fn open(&mut self) -> (u64, oneshot::Receiver<SessionResult>) {
        let session = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(session, tx);
        (session, rx)
    }

    /// Forget a session whose request never left.
    pub fn cancel(&mut self, session: u64) {
        self.pending.remove(&session);
    }

    pub fn resolve(&mut self, session: u64, reply: Reply) -> bool {
        self.settle(session, Ok(reply))
    }

    pub fn reject(&mut self, session: u64, error: WireError) -> bool {
        self.settle(session, Err(error))
    }

    fn settle(&mut self, session: u64, outcome: SessionResult) -> bool {
        match self.pending.remove(&session) {
            Some(tx) => {
                // Caller may have given up; nothing to do then.
                let _ = tx.send(outcome);
                true
            }
            None => {
                tracing::trace!("dropping reply for unknown session {}", session);
                false
            }
        }
    }

    /// Resolve `session` with `head` carrying a fresh stream body; later
    /// chunks for the session feed that stream.
    pub fn stream_create(&mut self, session: u64, mut head: Response) -> bool {
        if !self.pending.contains_key(&session) {
            tracing::trace!("dropping stream head for unknown session {}", session);
            return false;
        }
        let (sender, stream) = BodyStream::channel();
        head.body = Body::Stream(stream);
        self.streams.insert(session, sender);
        self.resolve(session, Reply::Response(head))
    }

    pub fn stream_data(&mut self, session: u64, chunk: Value) -> bool {
        let Some(sender) = self.streams.get(&session) else {
            return false;
        };
        if sender.send(chunk).is_err() {
            // Consumer dropped the body; swallow the rest of the stream.
            self.streams.remove(&session);
            return false;
        }
        true
    }

    pub fn stream_end(&mut self, session: u64) -> bool {
        self.streams.remove(&session).is_some()
    }

    pub fn stream_error(&mut self, session: u64, error: WireError) -> bool {
        match self.streams.remove(&session) {
            Some(sender) => {
                sender.fail(error.into_error());
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}
