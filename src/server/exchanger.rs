use std::{net::SocketAddr, sync::Arc};

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc::{Receiver, Sender, channel};

/// One outbound work item: a serialized frame plus the flush hint for
/// the endpoint's train buffer.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub bytes: Bytes,
    pub flush: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// No endpoint task owns this target.
    Unroutable,
    /// The endpoint's queue is full; the caller decides whether that is
    /// a dropped notification or an `E_NOT_REACHABLE` to the sender.
    Overflow,
}

/// Queue depth per endpoint. Overflow is backpressure, not memory.
const ENDPOINT_QUEUE_SIZE: usize = 512;

/// Handles frame forwarding between the routing side and the endpoint
/// tasks.
///
/// Each endpoint task registers the peer addresses it owns and drains
/// its receiver; the routing side posts work items by target address and
/// never blocks on a slow endpoint.
#[derive(Clone)]
pub struct Exchanger(Arc<RwLock<AHashMap<SocketAddr, Sender<Outbound>>>>);

impl Default for Exchanger {
    fn default() -> Self {
        Self(Arc::new(RwLock::new(AHashMap::with_capacity(64))))
    }
}

impl Exchanger {
    /// Register `target` and get the receiver its frames arrive on.
    pub fn get_receiver(&self, target: SocketAddr) -> Receiver<Outbound> {
        let (sender, receiver) = channel(ENDPOINT_QUEUE_SIZE);
        self.0.write().insert(target, sender);
        receiver
    }

    /// Register `target` unless an endpoint task already owns it. Used
    /// by the dial-on-demand path so concurrent senders race to exactly
    /// one connection task.
    pub fn register_if_absent(&self, target: SocketAddr) -> Option<Receiver<Outbound>> {
        let mut table = self.0.write();
        if table.contains_key(&target) {
            return None;
        }

        let (sender, receiver) = channel(ENDPOINT_QUEUE_SIZE);
        table.insert(target, sender);
        Some(receiver)
    }

    /// Post a frame towards `target`.
    ///
    /// Never blocks: a full queue is reported as [`SendError::Overflow`]
    /// and the frame is discarded here.
    pub fn send(&self, target: &SocketAddr, item: Outbound) -> Result<(), SendError> {
        let mut stale = false;

        let result = {
            match self.0.read().get(target) {
                None => Err(SendError::Unroutable),
                Some(sender) => match sender.try_send(item) {
                    Ok(()) => Ok(()),
                    Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => Err(SendError::Overflow),
                    Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                        stale = true;
                        Err(SendError::Unroutable)
                    }
                },
            }
        };

        if stale {
            self.remove(target);
        }

        result
    }

    pub fn contains(&self, target: &SocketAddr) -> bool {
        self.0.read().contains_key(target)
    }

    /// Delete a gone endpoint.
    pub fn remove(&self, target: &SocketAddr) {
        drop(self.0.write().remove(target))
    }
}
