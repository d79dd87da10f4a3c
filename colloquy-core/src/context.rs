//! Context Resolver
//!
//! Derives the replay list for a model call: the causally consistent,
//! alternating request/response history ending at an anchor request.
//!
//! The scan walks backward from the anchor. A response group contributes only
//! when its accepted candidate is available; its request is then picked up by
//! interaction id. The scan stops at the nearest erase marker.

use crate::client::ChatMessage;
use crate::error::{EngineError, Result};
use crate::timeline::{InteractionId, ItemKind, Timeline, TimelineItem};

impl Timeline {
    /// Indices of the history preceding `end` (exclusive), oldest first.
    ///
    /// Does not include any anchor; used both for resolution and for
    /// estimating the context a new request would carry.
    pub fn history_indices(&self, end: usize) -> Vec<usize> {
        assert!(
            end <= self.len(),
            "history end {} out of bounds (len {})",
            end,
            self.len()
        );

        let items = self.items();
        // A group waiting for its request; it is dropped if another group
        // or the scan boundary turns up first
        let mut pending: Option<(usize, InteractionId)> = None;
        let mut picked = Vec::new();

        for index in (0..end).rev() {
            match &items[index] {
                TimelineItem::Erase(_) => break,
                TimelineItem::Response(group) => {
                    pending = group
                        .available_accepted()
                        .map(|_| (index, group.interaction_id));
                }
                TimelineItem::Request(request) => {
                    if let Some((group_index, _)) =
                        pending.filter(|(_, id)| *id == request.interaction_id)
                    {
                        picked.push(group_index);
                        picked.push(index);
                        pending = None;
                    }
                }
            }
        }

        picked.reverse();
        picked
    }

    /// Indices of the replay list anchored at `end_index` (default: last item)
    pub fn resolve_indices(&self, end_index: Option<usize>) -> Result<Vec<usize>> {
        let anchor = match end_index {
            Some(index) => index,
            None => self.len().checked_sub(1).ok_or(EngineError::InvalidAnchor {
                index: 0,
                found: "nothing",
            })?,
        };

        let item = self.get(anchor).unwrap_or_else(|| {
            panic!(
                "anchor index {} out of bounds (len {})",
                anchor,
                self.len()
            )
        });
        if item.kind() != ItemKind::Request {
            return Err(EngineError::InvalidAnchor {
                index: anchor,
                found: item.kind().as_str(),
            });
        }

        let mut indices = self.history_indices(anchor);
        indices.push(anchor);
        Ok(indices)
    }

    /// The replay list anchored at `end_index` (default: last item).
    ///
    /// Oldest first; the last element is the anchor request.
    pub fn resolve_context(&self, end_index: Option<usize>) -> Result<Vec<TimelineItem>> {
        let indices = self.resolve_indices(end_index)?;
        Ok(indices
            .into_iter()
            .map(|i| self.items()[i].clone())
            .collect())
    }
}

/// Flatten a replay list into the messages sent to the model
pub fn to_messages(replay: &[TimelineItem]) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    for item in replay {
        match item {
            TimelineItem::Request(request) => messages.push(request.message()),
            TimelineItem::Response(group) => {
                if let Some(candidate) = group.accepted() {
                    messages.extend(candidate.messages.iter().cloned());
                }
            }
            TimelineItem::Erase(_) => {}
        }
    }
    messages
}
