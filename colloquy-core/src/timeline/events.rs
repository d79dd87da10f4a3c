//! Timeline change notifications
//!
//! Every structural mutation bumps the timeline version and publishes one
//! [`TimelineEvent`]. Subscribers (views, persistence, derived-state caches)
//! receive a [`TimelineNotification`] through a broadcast channel; slow
//! subscribers lag rather than block mutation.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::item::{CandidateId, ItemId, ItemKind};

/// A single change to a session timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineEvent {
    ItemInserted {
        index: usize,
        id: ItemId,
        kind: ItemKind,
    },
    ItemRemoved {
        index: usize,
        id: ItemId,
        kind: ItemKind,
    },
    CandidateAdded {
        group: ItemId,
        candidate: CandidateId,
    },
    CandidateReplaced {
        group: ItemId,
        candidate: CandidateId,
    },
    CandidateRemoved {
        group: ItemId,
        candidate: CandidateId,
    },
    AcceptedChanged {
        group: ItemId,
        accepted: Option<CandidateId>,
    },
    CandidateFlagsChanged {
        group: ItemId,
        candidate: CandidateId,
    },
    TotalsChanged {
        tokens_consumed: u64,
        total_price: f64,
    },
    SystemPromptChanged,
}

/// An event tagged with the timeline version it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineNotification {
    pub version: u64,
    pub event: TimelineEvent,
}

pub type TimelineSender = broadcast::Sender<TimelineNotification>;
pub type TimelineReceiver = broadcast::Receiver<TimelineNotification>;

/// Create a notification channel with the given buffer size
pub fn timeline_channel(buffer_size: usize) -> TimelineSender {
    let (tx, _rx) = broadcast::channel(buffer_size.max(1));
    tx
}
