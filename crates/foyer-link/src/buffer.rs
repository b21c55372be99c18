//! Holds signals that arrive before their peer link exists.
//!
//! The relay's `user-joined` fan-out can outrace our own membership
//! processing, so an offer may land here first. Entries are drained exactly
//! once into the link created for that peer, or discarded wholesale when the
//! peer departs so a later link reusing the same userId never replays them.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use foyer_proto::SignalPayload;

pub struct PendingSignalBuffer {
    queues: HashMap<String, VecDeque<SignalPayload>>,
    cap: usize,
}

impl PendingSignalBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            queues: HashMap::new(),
            cap,
        }
    }

    /// Queue a signal for a peer with no link yet. At the cap the newest
    /// signal is dropped: the queued prefix keeps its meaning, while dropping
    /// from the front would corrupt the offer/candidate order.
    pub fn push(&mut self, from_user_id: &str, payload: SignalPayload) {
        let queue = self.queues.entry(from_user_id.to_string()).or_default();
        if queue.len() >= self.cap {
            warn!(
                target: "link",
                peer = %from_user_id,
                cap = self.cap,
                kind = payload.kind(),
                "pending signal buffer full, dropping newest signal"
            );
            return;
        }
        queue.push_back(payload);
    }

    /// Remove and return everything queued for a peer, in arrival order.
    pub fn drain(&mut self, user_id: &str) -> Vec<SignalPayload> {
        self.queues
            .remove(user_id)
            .map(|queue| queue.into_iter().collect())
            .unwrap_or_default()
    }

    /// Throw away everything queued for a departed peer.
    pub fn discard(&mut self, user_id: &str) {
        if let Some(queue) = self.queues.remove(user_id) {
            if !queue.is_empty() {
                debug!(
                    target: "link",
                    peer = %user_id,
                    count = queue.len(),
                    "discarded buffered signals for departed peer"
                );
            }
        }
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }

    #[cfg(test)]
    pub fn pending(&self, user_id: &str) -> usize {
        self.queues.get(user_id).map(VecDeque::len).unwrap_or(0)
    }
}
