//! Conversation Session
//!
//! A [`Session`] owns one timeline plus the state around it: system prompt,
//! running totals, the busy counter and derived display state. All of its
//! methods are synchronous.
//!
//! Concurrent callers go through a [`SessionHandle`], which serializes
//! mutation behind a per-session lock and only releases it while awaiting the
//! chat client.
//!
//! # Example
//!
//! ```rust,ignore
//! use colloquy_core::session::{Session, SessionHandle};
//!
//! let mut session = Session::new("Trip planning").with_system_prompt("Be concise");
//! let (_, group) = session.submit_turn("Where should I go in May?");
//!
//! let handle = SessionHandle::new(session, registry);
//! handle.new_candidate(group, client, CancellationToken::new()).await?;
//! ```

mod derived;
mod handle;
mod responding;

pub use derived::DerivedState;
pub use handle::SessionHandle;
pub use responding::{RespondingCounter, RespondingGuard};

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::client::{ChatMessage, ClientIdentity, CompletionResult, TokenUsage};
use crate::context::to_messages;
use crate::error::{EngineError, Result};
use crate::timeline::{
    CandidateId, DEFAULT_EVENT_BUFFER, EraseMarker, ItemId, RequestTurn, ResponseCandidate,
    ResponseGroup, Timeline, TimelineEvent, TimelineItem, TimelineReceiver,
};
use crate::tokens::{CharRatioEstimator, TokenEstimator};

/// A branching conversation
pub struct Session {
    id: String,
    topic: String,
    pub(crate) system_prompt: Option<String>,
    pub(crate) timeline: Timeline,
    tokens_consumed: u64,
    total_price: f64,
    default_client: Option<ClientIdentity>,
    responding: RespondingCounter,
    estimator: Arc<dyn TokenEstimator>,
    derived: DerivedState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Session {
    /// Create an empty session
    pub fn new(topic: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), topic)
    }

    /// Create an empty session with a caller-chosen id
    pub fn with_id(id: impl Into<String>, topic: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            topic: topic.into(),
            system_prompt: None,
            timeline: Timeline::new(),
            tokens_consumed: 0,
            total_price: 0.0,
            default_client: None,
            responding: RespondingCounter::new(),
            estimator: Arc::new(CharRatioEstimator::default()),
            derived: DerivedState::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_default_client(mut self, identity: ClientIdentity) -> Self {
        self.default_client = Some(identity);
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Replace the timeline wholesale (used when restoring snapshots)
    pub(crate) fn with_timeline(mut self, timeline: Timeline) -> Self {
        self.timeline = timeline;
        self.refresh();
        self
    }

    pub(crate) fn with_totals(mut self, tokens_consumed: u64, total_price: f64) -> Self {
        self.tokens_consumed = tokens_consumed;
        self.total_price = total_price;
        self
    }

    pub(crate) fn with_timestamps(
        mut self,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        self.created_at = created_at;
        self.updated_at = updated_at;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn set_topic(&mut self, topic: impl Into<String>) {
        self.topic = topic.into();
        self.touch();
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn set_system_prompt(&mut self, prompt: Option<String>) {
        self.system_prompt = prompt;
        self.timeline.notify(TimelineEvent::SystemPromptChanged);
        self.touch();
    }

    pub fn default_client(&self) -> Option<&ClientIdentity> {
        self.default_client.as_ref()
    }

    pub fn set_default_client(&mut self, identity: Option<ClientIdentity>) {
        self.default_client = identity;
        self.touch();
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn items(&self) -> &[TimelineItem] {
        self.timeline.items()
    }

    pub fn len(&self) -> usize {
        self.timeline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timeline.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.timeline.version()
    }

    /// Receive a notification for every mutation from now on
    pub fn subscribe(&self) -> TimelineReceiver {
        self.timeline.subscribe()
    }

    pub fn tokens_consumed(&self) -> u64 {
        self.tokens_consumed
    }

    pub fn total_price(&self) -> f64 {
        self.total_price
    }

    pub fn responding_count(&self) -> usize {
        self.responding.count()
    }

    /// Shared handle on the busy counter
    pub fn responding(&self) -> RespondingCounter {
        self.responding.clone()
    }

    pub fn derived(&self) -> &DerivedState {
        &self.derived
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Recompute derived state after a mutation
    pub(crate) fn refresh(&mut self) {
        self.derived = DerivedState::compute(&self.timeline);
        self.touch();
    }

    // ── Timeline mutation ─────────────────────────────────────────

    pub fn append(&mut self, item: TimelineItem) -> usize {
        let index = self.timeline.append(item);
        self.refresh();
        index
    }

    pub fn insert_at(&mut self, index: usize, item: TimelineItem) {
        self.timeline.insert_at(index, item);
        self.refresh();
    }

    pub fn remove_at(&mut self, index: usize) -> TimelineItem {
        let item = self.timeline.remove_at(index);
        self.refresh();
        item
    }

    pub fn delete_item(&mut self, id: ItemId) -> Result<Vec<TimelineItem>> {
        let removed = self.timeline.delete_item(id)?;
        self.refresh();
        Ok(removed)
    }

    pub fn remove_range(&mut self, from: usize, to: usize) -> Vec<TimelineItem> {
        let removed = self.timeline.remove_range(from, to);
        self.refresh();
        removed
    }

    pub fn prune_unavailable(&mut self) -> Vec<TimelineItem> {
        let removed = self.timeline.prune_unavailable();
        self.refresh();
        removed
    }

    pub fn clear(&mut self) {
        self.timeline.clear();
        self.refresh();
    }

    /// Append a request with an empty response group.
    ///
    /// Returns the request index and the group id.
    pub fn submit_turn(&mut self, text: impl Into<String>) -> (usize, ItemId) {
        self.submit_request(RequestTurn::new(text))
    }

    /// Append a prepared request with an empty response group
    pub fn submit_request(&mut self, mut request: RequestTurn) -> (usize, ItemId) {
        request.estimated_tokens = self.estimator.estimate(&request.text);
        let group = ResponseGroup::new(request.interaction_id);
        let group_id = group.id;

        let index = self.timeline.append(request.into());
        self.timeline.append(group.into());
        self.refresh();
        tracing::debug!(session_id = %self.id, index, group = %group_id, "Turn submitted");
        (index, group_id)
    }

    /// Insert an erase marker (at the end when `index` is `None`)
    pub fn insert_erase_marker(&mut self, index: Option<usize>) -> ItemId {
        let marker = EraseMarker::new();
        let id = marker.id;
        let index = index.unwrap_or(self.timeline.len());
        self.timeline.insert_at(index, marker.into());
        self.refresh();
        id
    }

    /// Edit a request's text. Already-sent content is unaffected.
    pub fn edit_request(&mut self, id: ItemId, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        let tokens = self.estimator.estimate(&text);
        let index = self
            .timeline
            .position(id)
            .ok_or(EngineError::ItemNotFound(id))?;
        let request = self
            .timeline
            .get_mut(index)
            .and_then(|item| item.as_request_mut())
            .ok_or(EngineError::ItemNotFound(id))?;
        request.text = text;
        request.estimated_tokens = tokens;
        self.refresh();
        Ok(())
    }

    // ── Context ───────────────────────────────────────────────────

    /// The replay list anchored at `end_index` (default: last item)
    pub fn resolve_context(&self, end_index: Option<usize>) -> Result<Vec<TimelineItem>> {
        self.timeline.resolve_context(end_index)
    }

    /// Resolve the replay list, freezing every request in it, and flatten
    /// it into the messages to send.
    pub fn prepare_messages(&mut self, end_index: Option<usize>) -> Result<Vec<ChatMessage>> {
        let indices = self.timeline.resolve_indices(end_index)?;
        let mut replay = Vec::with_capacity(indices.len());
        for index in indices {
            if let Some(item) = self.timeline.get_mut(index) {
                if let Some(request) = item.as_request_mut() {
                    request.materialize();
                }
                replay.push(item.clone());
            }
        }
        Ok(to_messages(&replay))
    }

    // ── Totals ────────────────────────────────────────────────────

    /// Add the usage of one completed call to the running totals
    pub(crate) fn record_usage(&mut self, usage: TokenUsage, price: f64) {
        self.tokens_consumed += usage.total();
        self.total_price += price;
        self.timeline.notify(TimelineEvent::TotalsChanged {
            tokens_consumed: self.tokens_consumed,
            total_price: self.total_price,
        });
        self.touch();
    }

    // ── Candidate application (used by the branch manager) ─────────

    pub(crate) fn attach_candidate(
        &mut self,
        group_id: ItemId,
        candidate: ResponseCandidate,
    ) -> Result<CandidateId> {
        let candidate_id = candidate.id;
        let group = self.timeline.group_mut(group_id)?;
        group.push_accepted(candidate);
        self.timeline.notify(TimelineEvent::CandidateAdded {
            group: group_id,
            candidate: candidate_id,
        });
        self.timeline.notify(TimelineEvent::AcceptedChanged {
            group: group_id,
            accepted: Some(candidate_id),
        });
        self.refresh();
        Ok(candidate_id)
    }

    pub(crate) fn refill_candidate(
        &mut self,
        group_id: ItemId,
        candidate_id: CandidateId,
        source: ClientIdentity,
        result: CompletionResult,
    ) -> Result<()> {
        let group = self.timeline.group_mut(group_id)?;
        let candidate = group
            .candidate_mut(candidate_id)
            .ok_or(EngineError::CandidateNotFound(candidate_id))?;
        candidate.refill(source, result);
        self.timeline.notify(TimelineEvent::CandidateReplaced {
            group: group_id,
            candidate: candidate_id,
        });
        self.refresh();
        Ok(())
    }

    // ── Forking ───────────────────────────────────────────────────

    /// Start a new session from a copy of items `0..=through_index`
    pub fn fork(&self, through_index: usize) -> Session {
        assert!(
            through_index < self.timeline.len(),
            "fork index {} out of bounds (len {})",
            through_index,
            self.timeline.len()
        );
        let items = self.timeline.items()[..=through_index].to_vec();

        let mut fork = Session::new(format!("{} (fork)", self.topic))
            .with_timeline(Timeline::from_items(items, DEFAULT_EVENT_BUFFER));
        fork.system_prompt = self.system_prompt.clone();
        fork.default_client = self.default_client.clone();
        fork.estimator = Arc::clone(&self.estimator);
        tracing::debug!(
            session_id = %self.id,
            fork_id = %fork.id,
            through_index,
            "Session forked"
        );
        fork
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("items", &self.timeline.len())
            .field("tokens_consumed", &self.tokens_consumed)
            .field("total_price", &self.total_price)
            .field("responding", &self.responding.count())
            .finish()
    }
}
