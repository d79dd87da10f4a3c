//! Conversation Timeline
//!
//! The branching, editable record of a conversation.
//!
//! # Items
//!
//! - [`RequestTurn`] - a user turn, frozen into a [`ChatMessage`](crate::client::ChatMessage) on first send
//! - [`ResponseGroup`] - the candidate answers to one turn, exactly one accepted
//! - [`EraseMarker`] - a context boundary
//!
//! Requests and groups are correlated by [`InteractionId`], never by position
//! alone: a group whose request was deleted or never pasted is an orphan and
//! is simply unreachable during context resolution.
//!
//! # Example
//!
//! ```rust,ignore
//! use colloquy_core::timeline::{EraseMarker, RequestTurn, Timeline};
//!
//! let mut timeline = Timeline::new();
//! timeline.append(RequestTurn::new("Hello").into());
//! timeline.append(EraseMarker::new().into());
//!
//! let mut changes = timeline.subscribe();
//! ```

mod events;
mod item;
mod sequence;

pub use events::{
    TimelineEvent, TimelineNotification, TimelineReceiver, TimelineSender, timeline_channel,
};
pub use item::{
    CandidateId, EraseMarker, FinishState, InteractionId, ItemId, ItemKind, RequestTurn,
    ResponseCandidate, ResponseGroup, TimelineItem, ToolConfig,
};
pub use sequence::{DEFAULT_EVENT_BUFFER, Timeline};
