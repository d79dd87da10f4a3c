//! Timeline item types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::client::{Attachment, ChatMessage, ClientIdentity, CompletionResult, TokenUsage};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// Identity of a single timeline item
    ItemId
);
uuid_id!(
    /// Correlation key linking a request to its response group
    InteractionId
);
uuid_id!(
    /// Identity of a candidate within its group
    CandidateId
);

/// Discriminant of a [`TimelineItem`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Request,
    ResponseGroup,
    EraseMarker,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Request => "request",
            ItemKind::ResponseGroup => "response group",
            ItemKind::EraseMarker => "erase marker",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tools offered to the model for a request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Names of enabled tools
    #[serde(default)]
    pub enabled_tools: Vec<String>,
    /// Whether the model may call several tools at once
    #[serde(default)]
    pub parallel_calls: bool,
}

/// A user turn submitted to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTurn {
    pub id: ItemId,
    pub interaction_id: InteractionId,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub tool_config: ToolConfig,
    /// Supplied by the token estimator at creation
    #[serde(default)]
    pub estimated_tokens: u64,
    pub created_at: DateTime<Utc>,
    /// Frozen on first send; later edits to `text` do not touch it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_message: Option<ChatMessage>,
}

impl RequestTurn {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: ItemId::new(),
            interaction_id: InteractionId::new(),
            text: text.into(),
            attachments: Vec::new(),
            tool_config: ToolConfig::default(),
            estimated_tokens: 0,
            created_at: Utc::now(),
            created_message: None,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_tool_config(mut self, tool_config: ToolConfig) -> Self {
        self.tool_config = tool_config;
        self
    }

    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = tokens;
        self
    }

    /// The message as it was first sent, if it has been sent
    pub fn created_message(&self) -> Option<&ChatMessage> {
        self.created_message.as_ref()
    }

    pub fn is_materialized(&self) -> bool {
        self.created_message.is_some()
    }

    /// Freeze the outgoing message on first call and return it
    pub fn materialize(&mut self) -> &ChatMessage {
        let message = match self.created_message.take() {
            Some(message) => message,
            None => self.build_message(),
        };
        self.created_message.insert(message)
    }

    /// The frozen message, or what would be frozen right now
    pub fn message(&self) -> ChatMessage {
        self.created_message
            .clone()
            .unwrap_or_else(|| self.build_message())
    }

    fn build_message(&self) -> ChatMessage {
        ChatMessage::user(self.text.clone()).with_attachments(self.attachments.clone())
    }

    /// Content equality used for paste deduplication.
    ///
    /// Ignores the item id and creation time.
    pub fn structurally_eq(&self, other: &RequestTurn) -> bool {
        self.interaction_id == other.interaction_id
            && self.text == other.text
            && self.attachments == other.attachments
            && self.tool_config == other.tool_config
    }

    /// Copy the content into a brand new turn with fresh ids
    pub fn clone_content(&self) -> RequestTurn {
        RequestTurn {
            id: ItemId::new(),
            interaction_id: InteractionId::new(),
            text: self.text.clone(),
            attachments: self.attachments.clone(),
            tool_config: self.tool_config.clone(),
            estimated_tokens: self.estimated_tokens,
            created_at: Utc::now(),
            created_message: None,
        }
    }
}

/// How a model call ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FinishState {
    Ok,
    Interrupted,
    Error { reason: String },
}

impl FinishState {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, FinishState::Interrupted)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, FinishState::Error { .. })
    }
}

/// One alternative answer to a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseCandidate {
    pub id: CandidateId,
    pub source: ClientIdentity,
    pub messages: Vec<ChatMessage>,
    pub finish_state: FinishState,
    #[serde(default)]
    pub manually_marked_valid: bool,
    #[serde(default = "default_true")]
    pub include_in_context: bool,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub price: f64,
    #[serde(with = "humantime_serde", default)]
    pub latency: Duration,
    pub created_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl ResponseCandidate {
    pub fn from_completion(source: ClientIdentity, result: CompletionResult) -> Self {
        Self {
            id: CandidateId::new(),
            source,
            messages: result.messages,
            finish_state: result.finish_state,
            manually_marked_valid: false,
            include_in_context: true,
            usage: result.usage,
            price: result.price,
            latency: result.latency,
            created_at: Utc::now(),
        }
    }

    /// Whether this candidate may be replayed to the model
    pub fn is_available_in_context(&self) -> bool {
        (self.manually_marked_valid || !self.finish_state.is_interrupted())
            && self.include_in_context
    }

    /// Overwrite the content with a fresh result, keeping id and flags
    pub(crate) fn refill(&mut self, source: ClientIdentity, result: CompletionResult) {
        self.source = source;
        self.messages = result.messages;
        self.finish_state = result.finish_state;
        self.usage = result.usage;
        self.price = result.price;
        self.latency = result.latency;
        self.created_at = Utc::now();
    }
}

/// The candidate answers to one turn.
///
/// A non-empty group always has exactly one accepted candidate; an empty one
/// has none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseGroup {
    pub id: ItemId,
    pub interaction_id: InteractionId,
    candidates: Vec<ResponseCandidate>,
    accepted: Option<usize>,
}

impl ResponseGroup {
    pub fn new(interaction_id: InteractionId) -> Self {
        Self {
            id: ItemId::new(),
            interaction_id,
            candidates: Vec::new(),
            accepted: None,
        }
    }

    pub fn candidates(&self) -> &[ResponseCandidate] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn is_multi(&self) -> bool {
        self.candidates.len() > 1
    }

    pub fn accepted_index(&self) -> Option<usize> {
        self.accepted
    }

    pub fn accepted(&self) -> Option<&ResponseCandidate> {
        self.accepted.and_then(|i| self.candidates.get(i))
    }

    /// The accepted candidate if it may be replayed
    pub fn available_accepted(&self) -> Option<&ResponseCandidate> {
        self.accepted().filter(|c| c.is_available_in_context())
    }

    pub fn has_available_candidate(&self) -> bool {
        self.candidates.iter().any(|c| c.is_available_in_context())
    }

    pub fn position(&self, candidate: CandidateId) -> Option<usize> {
        self.candidates.iter().position(|c| c.id == candidate)
    }

    pub fn candidate(&self, candidate: CandidateId) -> Option<&ResponseCandidate> {
        self.candidates.iter().find(|c| c.id == candidate)
    }

    pub(crate) fn candidate_mut(&mut self, candidate: CandidateId) -> Option<&mut ResponseCandidate> {
        self.candidates.iter_mut().find(|c| c.id == candidate)
    }

    /// Append a candidate and make it the accepted one
    pub(crate) fn push_accepted(&mut self, candidate: ResponseCandidate) -> usize {
        self.candidates.push(candidate);
        let index = self.candidates.len() - 1;
        self.accepted = Some(index);
        index
    }

    /// Make `candidate` canonical. Returns false if it is not in the group.
    pub(crate) fn accept(&mut self, candidate: CandidateId) -> bool {
        match self.position(candidate) {
            Some(index) => {
                self.accepted = Some(index);
                true
            }
            None => false,
        }
    }

    /// Remove a candidate, re-accepting the first remaining one if the
    /// accepted candidate goes away. The last candidate is never removed.
    pub(crate) fn remove(&mut self, candidate: CandidateId) -> Option<ResponseCandidate> {
        if self.candidates.len() <= 1 {
            return None;
        }
        let index = self.position(candidate)?;
        let removed = self.candidates.remove(index);
        self.accepted = match self.accepted {
            Some(accepted) if accepted == index => Some(0),
            Some(accepted) if accepted > index => Some(accepted - 1),
            other => other,
        };
        Some(removed)
    }

    /// Whether the accepted-index bookkeeping is consistent
    pub fn is_consistent(&self) -> bool {
        match self.accepted {
            None => self.candidates.is_empty(),
            Some(index) => index < self.candidates.len(),
        }
    }
}

/// A context boundary; earlier turns are not replayed past it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EraseMarker {
    pub id: ItemId,
    pub created_at: DateTime<Utc>,
}

impl EraseMarker {
    pub fn new() -> Self {
        Self {
            id: ItemId::new(),
            created_at: Utc::now(),
        }
    }
}

impl Default for EraseMarker {
    fn default() -> Self {
        Self::new()
    }
}

/// An entry in a session's timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimelineItem {
    Request(RequestTurn),
    Response(ResponseGroup),
    Erase(EraseMarker),
}

impl TimelineItem {
    pub fn id(&self) -> ItemId {
        match self {
            TimelineItem::Request(r) => r.id,
            TimelineItem::Response(g) => g.id,
            TimelineItem::Erase(e) => e.id,
        }
    }

    pub fn kind(&self) -> ItemKind {
        match self {
            TimelineItem::Request(_) => ItemKind::Request,
            TimelineItem::Response(_) => ItemKind::ResponseGroup,
            TimelineItem::Erase(_) => ItemKind::EraseMarker,
        }
    }

    pub fn interaction_id(&self) -> Option<InteractionId> {
        match self {
            TimelineItem::Request(r) => Some(r.interaction_id),
            TimelineItem::Response(g) => Some(g.interaction_id),
            TimelineItem::Erase(_) => None,
        }
    }

    pub fn as_request(&self) -> Option<&RequestTurn> {
        match self {
            TimelineItem::Request(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_request_mut(&mut self) -> Option<&mut RequestTurn> {
        match self {
            TimelineItem::Request(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&ResponseGroup> {
        match self {
            TimelineItem::Response(g) => Some(g),
            _ => None,
        }
    }

    pub(crate) fn as_response_mut(&mut self) -> Option<&mut ResponseGroup> {
        match self {
            TimelineItem::Response(g) => Some(g),
            _ => None,
        }
    }

    pub fn is_erase(&self) -> bool {
        matches!(self, TimelineItem::Erase(_))
    }
}

impl From<RequestTurn> for TimelineItem {
    fn from(request: RequestTurn) -> Self {
        TimelineItem::Request(request)
    }
}

impl From<ResponseGroup> for TimelineItem {
    fn from(group: ResponseGroup) -> Self {
        TimelineItem::Response(group)
    }
}

impl From<EraseMarker> for TimelineItem {
    fn from(marker: EraseMarker) -> Self {
        TimelineItem::Erase(marker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(finish_state: FinishState) -> ResponseCandidate {
        let mut result = CompletionResult::text("answer", TokenUsage::new(3, 5));
        result.finish_state = finish_state;
        ResponseCandidate::from_completion(ClientIdentity::new("test", "model"), result)
    }

    #[test]
    fn test_availability_rules() {
        let ok = candidate(FinishState::Ok);
        assert!(ok.is_available_in_context());

        let mut interrupted = candidate(FinishState::Interrupted);
        assert!(!interrupted.is_available_in_context());
        interrupted.manually_marked_valid = true;
        assert!(interrupted.is_available_in_context());

        let mut excluded = candidate(FinishState::Error {
            reason: "rate limited".to_string(),
        });
        assert!(excluded.is_available_in_context());
        excluded.include_in_context = false;
        assert!(!excluded.is_available_in_context());
    }

    #[test]
    fn test_materialize_freezes_message() {
        let mut request = RequestTurn::new("original");
        assert!(!request.is_materialized());

        assert_eq!(request.materialize().content, "original");
        request.text = "edited".to_string();

        assert_eq!(request.created_message().unwrap().content, "original");
        assert_eq!(request.message().content, "original");
        assert_eq!(request.materialize().content, "original");
    }

    #[test]
    fn test_unmaterialized_message_tracks_text() {
        let mut request = RequestTurn::new("draft");
        request.text = "final".to_string();
        assert_eq!(request.message().content, "final");
    }

    #[test]
    fn test_structural_equality_ignores_item_id() {
        let request = RequestTurn::new("hello");
        let mut copy = request.clone();
        copy.id = ItemId::new();
        assert!(request.structurally_eq(&copy));

        copy.text = "other".to_string();
        assert!(!request.structurally_eq(&copy));
    }

    #[test]
    fn test_clone_content_gets_fresh_ids() {
        let mut request = RequestTurn::new("hello");
        request.materialize();
        let clone = request.clone_content();
        assert_ne!(clone.id, request.id);
        assert_ne!(clone.interaction_id, request.interaction_id);
        assert_eq!(clone.text, "hello");
        assert!(!clone.is_materialized());
    }

    #[test]
    fn test_group_accepts_latest_push() {
        let mut group = ResponseGroup::new(InteractionId::new());
        assert!(group.accepted().is_none());
        assert!(group.is_consistent());

        group.push_accepted(candidate(FinishState::Ok));
        let second = candidate(FinishState::Ok);
        let second_id = second.id;
        group.push_accepted(second);

        assert!(group.is_multi());
        assert_eq!(group.accepted().unwrap().id, second_id);
    }

    #[test]
    fn test_group_remove_reaccepts_first() {
        let mut group = ResponseGroup::new(InteractionId::new());
        let ids: Vec<_> = (0..3)
            .map(|_| {
                let c = candidate(FinishState::Ok);
                let id = c.id;
                group.push_accepted(c);
                id
            })
            .collect();

        assert!(group.remove(ids[2]).is_some());
        assert_eq!(group.accepted().unwrap().id, ids[0]);
        assert!(group.is_consistent());
    }

    #[test]
    fn test_group_remove_before_accepted_shifts_index() {
        let mut group = ResponseGroup::new(InteractionId::new());
        let first = candidate(FinishState::Ok);
        let first_id = first.id;
        group.push_accepted(first);
        let second = candidate(FinishState::Ok);
        let second_id = second.id;
        group.push_accepted(second);

        group.remove(first_id);
        assert_eq!(group.accepted().unwrap().id, second_id);
        assert_eq!(group.accepted_index(), Some(0));
    }

    #[test]
    fn test_group_never_removes_last_candidate() {
        let mut group = ResponseGroup::new(InteractionId::new());
        let only = candidate(FinishState::Ok);
        let only_id = only.id;
        group.push_accepted(only);

        assert!(group.remove(only_id).is_none());
        assert_eq!(group.len(), 1);
        assert_eq!(group.accepted_index(), Some(0));
    }

    #[test]
    fn test_item_serde_tagging() {
        let item = TimelineItem::from(EraseMarker::new());
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["kind"], "erase");

        let restored: TimelineItem = serde_json::from_value(json).unwrap();
        assert_eq!(restored, item);
    }
}
