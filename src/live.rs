//! Live fan-out of poll state changes to connected viewers.
//!
//! One logical channel per poll; the public and admin tokens both route to
//! it, so admin viewers stay subscribed even if the public token is rotated.
//! Each channel is a broadcast queue of 32 messages; a subscriber that
//! falls behind loses the oldest messages first and keeps receiving the
//! fresh ones. Delivery is FIFO per channel; there is no cross-channel
//! ordering.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Per-subscriber queue depth. Overflow drops the oldest entries.
const CHANNEL_CAPACITY: usize = 32;

/// Occupancy of one organization option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotStatus {
    pub current_count: i64,
    pub max_capacity: Option<i64>,
}

/// Messages sent to viewers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveMessage {
    /// Post-commit occupancy for every option of an organization poll.
    SlotUpdate { slots: BTreeMap<i64, SlotStatus> },
    /// Something about the poll's votes changed; viewers re-fetch.
    VoteUpdate,
    /// Current number of connected viewers.
    ViewerCount { count: usize },
}

struct Channel {
    sender: broadcast::Sender<LiveMessage>,
    viewers: AtomicUsize,
}

/// Registry of live channels.
#[derive(Clone)]
pub struct LiveDispatcher {
    channels: Arc<DashMap<Uuid, Arc<Channel>>>,
}

impl LiveDispatcher {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
        }
    }

    fn channel(&self, poll_id: Uuid) -> Arc<Channel> {
        self.channels
            .entry(poll_id)
            .or_insert_with(|| {
                Arc::new(Channel {
                    sender: broadcast::channel(CHANNEL_CAPACITY).0,
                    viewers: AtomicUsize::new(0),
                })
            })
            .clone()
    }

    /// Join a poll's channel. The new viewer count is broadcast to everyone,
    /// including the joiner.
    pub fn subscribe(&self, poll_id: Uuid) -> LiveSubscription {
        let channel = self.channel(poll_id);
        let receiver = channel.sender.subscribe();
        let count = channel.viewers.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = channel.sender.send(LiveMessage::ViewerCount { count });

        LiveSubscription {
            receiver,
            poll_id,
            dispatcher: self.clone(),
        }
    }

    /// Broadcast to a poll's viewers. A channel with no subscribers drops
    /// the message.
    pub fn publish(&self, poll_id: Uuid, message: LiveMessage) {
        if let Some(channel) = self.channels.get(&poll_id) {
            let _ = channel.sender.send(message);
        }
    }

    pub fn viewer_count(&self, poll_id: Uuid) -> usize {
        self.channels
            .get(&poll_id)
            .map(|c| c.viewers.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Drop channels nobody watches. Called from the periodic sweep.
    pub fn sweep(&self) {
        self.channels
            .retain(|_, channel| channel.viewers.load(Ordering::SeqCst) > 0);
    }

    fn leave(&self, poll_id: Uuid) {
        if let Some(channel) = self.channels.get(&poll_id) {
            let before = channel.viewers.fetch_sub(1, Ordering::SeqCst);
            let count = before.saturating_sub(1);
            let _ = channel.sender.send(LiveMessage::ViewerCount { count });
        }
    }
}

impl Default for LiveDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// A viewer's subscription. Dropping it leaves the channel and broadcasts
/// the reduced viewer count.
pub struct LiveSubscription {
    pub receiver: broadcast::Receiver<LiveMessage>,
    poll_id: Uuid,
    dispatcher: LiveDispatcher,
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        self.dispatcher.leave(self.poll_id);
    }
}
