//! Ordered timeline container

use std::fmt;

use super::events::{
    TimelineEvent, TimelineNotification, TimelineReceiver, TimelineSender, timeline_channel,
};
use super::item::{ItemId, ResponseGroup, TimelineItem};
use crate::error::{EngineError, Result};

/// Default capacity of the notification channel
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// The ordered list of items making up a session.
///
/// Index arguments are a caller contract: passing an out-of-range index is a
/// programming error and panics.
pub struct Timeline {
    items: Vec<TimelineItem>,
    version: u64,
    events: TimelineSender,
}

impl Timeline {
    pub fn new() -> Self {
        Self::from_items(Vec::new(), DEFAULT_EVENT_BUFFER)
    }

    pub fn from_items(items: Vec<TimelineItem>, event_buffer: usize) -> Self {
        Self {
            items,
            version: 0,
            events: timeline_channel(event_buffer),
        }
    }

    pub fn items(&self) -> &[TimelineItem] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TimelineItem> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TimelineItem> {
        self.items.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut TimelineItem> {
        self.items.get_mut(index)
    }

    /// Monotonic counter bumped by every mutation
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn subscribe(&self) -> TimelineReceiver {
        self.events.subscribe()
    }

    pub fn position(&self, id: ItemId) -> Option<usize> {
        self.items.iter().position(|item| item.id() == id)
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.position(id).is_some()
    }

    /// Index and group for a response group id
    pub fn group(&self, id: ItemId) -> Option<(usize, &ResponseGroup)> {
        let index = self.position(id)?;
        self.items[index].as_response().map(|g| (index, g))
    }

    pub(crate) fn group_mut(&mut self, id: ItemId) -> Result<&mut ResponseGroup> {
        self.items
            .iter_mut()
            .find(|item| item.id() == id)
            .and_then(|item| item.as_response_mut())
            .ok_or(EngineError::ItemNotFound(id))
    }

    pub(crate) fn notify(&mut self, event: TimelineEvent) {
        self.version += 1;
        // No subscribers is fine
        let _ = self.events.send(TimelineNotification {
            version: self.version,
            event,
        });
    }

    pub fn append(&mut self, item: TimelineItem) -> usize {
        let index = self.items.len();
        self.insert_at(index, item);
        index
    }

    pub fn insert_at(&mut self, index: usize, item: TimelineItem) {
        assert!(
            index <= self.items.len(),
            "insert index {} out of bounds (len {})",
            index,
            self.items.len()
        );
        let (id, kind) = (item.id(), item.kind());
        self.items.insert(index, item);
        tracing::debug!(index, item_id = %id, %kind, "Timeline item inserted");
        self.notify(TimelineEvent::ItemInserted { index, id, kind });
    }

    pub fn remove_at(&mut self, index: usize) -> TimelineItem {
        assert!(
            index < self.items.len(),
            "remove index {} out of bounds (len {})",
            index,
            self.items.len()
        );
        let item = self.items.remove(index);
        let (id, kind) = (item.id(), item.kind());
        tracing::debug!(index, item_id = %id, %kind, "Timeline item removed");
        self.notify(TimelineEvent::ItemRemoved { index, id, kind });
        item
    }

    /// Delete an item by id.
    ///
    /// Deleting a request also deletes the response group immediately after
    /// it when the interaction ids match.
    pub fn delete_item(&mut self, id: ItemId) -> Result<Vec<TimelineItem>> {
        let index = self.position(id).ok_or(EngineError::ItemNotFound(id))?;
        let removed = self.remove_at(index);
        let mut removed_items = Vec::with_capacity(2);

        if let TimelineItem::Request(request) = &removed {
            let follows = self
                .items
                .get(index)
                .and_then(|next| next.as_response())
                .is_some_and(|group| group.interaction_id == request.interaction_id);
            removed_items.push(removed);
            if follows {
                removed_items.push(self.remove_at(index));
            }
        } else {
            removed_items.push(removed);
        }

        Ok(removed_items)
    }

    /// Remove items in `from..to`
    pub fn remove_range(&mut self, from: usize, to: usize) -> Vec<TimelineItem> {
        assert!(
            from <= to && to <= self.items.len(),
            "remove range {}..{} out of bounds (len {})",
            from,
            to,
            self.items.len()
        );
        (from..to).map(|_| self.remove_at(from)).collect()
    }

    /// Drop every response group without an available candidate, together
    /// with its matching request. Returns the removed items.
    pub fn prune_unavailable(&mut self) -> Vec<TimelineItem> {
        let mut removed = Vec::new();
        let mut index = self.items.len();

        while index > 0 {
            index -= 1;
            let Some(group) = self.items[index].as_response() else {
                continue;
            };
            if group.has_available_candidate() {
                continue;
            }

            let interaction_id = group.interaction_id;
            removed.push(self.remove_at(index));

            if index > 0
                && self.items[index - 1]
                    .as_request()
                    .is_some_and(|r| r.interaction_id == interaction_id)
            {
                index -= 1;
                removed.push(self.remove_at(index));
            }
        }

        if !removed.is_empty() {
            tracing::debug!(removed = removed.len(), "Pruned unavailable turns");
        }
        removed
    }

    /// Remove every item
    pub fn clear(&mut self) {
        let len = self.items.len();
        self.remove_range(0, len);
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Timeline {
    /// Clones the items into an independent timeline with its own channel
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            version: self.version,
            events: timeline_channel(DEFAULT_EVENT_BUFFER),
        }
    }
}

impl fmt::Debug for Timeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeline")
            .field("items", &self.items)
            .field("version", &self.version)
            .finish()
    }
}
