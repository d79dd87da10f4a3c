//! Branch Manager
//!
//! Operations on a turn's candidate set. Switching, removing and flagging
//! candidates are synchronous [`Session`] methods; producing candidates
//! requires a model call and goes through a [`SessionHandle`].
//!
//! Model calls never fail past this boundary: transport errors become
//! [`FinishState::Error`] and cancellation becomes
//! [`FinishState::Interrupted`] on the stored candidate. The `Err` cases left
//! are structural (missing group, bad anchor, no client).

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::{ChatClient, ChatMessage, CompletionResult, TokenUsage};
use crate::error::{EngineError, Result};
use crate::session::{Session, SessionHandle};
use crate::timeline::{CandidateId, ItemId, ResponseCandidate, TimelineEvent};

impl Session {
    /// Make `candidate` the canonical answer of `group`. No network call.
    pub fn switch_accepted(&mut self, group: ItemId, candidate: CandidateId) -> Result<()> {
        let response = self.timeline.group_mut(group)?;
        if !response.accept(candidate) {
            return Err(EngineError::CandidateNotFound(candidate));
        }
        self.timeline.notify(TimelineEvent::AcceptedChanged {
            group,
            accepted: Some(candidate),
        });
        self.refresh();
        Ok(())
    }

    /// Remove a candidate from its group.
    ///
    /// Removing the only candidate is a no-op and returns `Ok(None)`.
    pub fn remove_candidate(
        &mut self,
        group: ItemId,
        candidate: CandidateId,
    ) -> Result<Option<ResponseCandidate>> {
        let response = self.timeline.group_mut(group)?;
        if response.position(candidate).is_none() {
            return Err(EngineError::CandidateNotFound(candidate));
        }
        let previously_accepted = response.accepted().map(|c| c.id);
        let Some(removed) = response.remove(candidate) else {
            return Ok(None);
        };
        let accepted = response.accepted().map(|c| c.id);

        self.timeline
            .notify(TimelineEvent::CandidateRemoved { group, candidate });
        if accepted != previously_accepted {
            self.timeline
                .notify(TimelineEvent::AcceptedChanged { group, accepted });
        }
        self.refresh();
        Ok(Some(removed))
    }

    /// Force an interrupted candidate into (or out of) context
    pub fn set_manually_valid(
        &mut self,
        group: ItemId,
        candidate: CandidateId,
        valid: bool,
    ) -> Result<()> {
        self.update_candidate_flags(group, candidate, |c| c.manually_marked_valid = valid)
    }

    /// Exclude a candidate from context without deleting it
    pub fn set_include_in_context(
        &mut self,
        group: ItemId,
        candidate: CandidateId,
        include: bool,
    ) -> Result<()> {
        self.update_candidate_flags(group, candidate, |c| c.include_in_context = include)
    }

    fn update_candidate_flags(
        &mut self,
        group: ItemId,
        candidate: CandidateId,
        update: impl FnOnce(&mut ResponseCandidate),
    ) -> Result<()> {
        let response = self.timeline.group_mut(group)?;
        let target = response
            .candidate_mut(candidate)
            .ok_or(EngineError::CandidateNotFound(candidate))?;
        update(target);
        self.timeline
            .notify(TimelineEvent::CandidateFlagsChanged { group, candidate });
        self.refresh();
        Ok(())
    }

    /// Messages and system prompt for a call answering `group`.
    ///
    /// The anchor is the item immediately before the group.
    pub(crate) fn prepare_for_group(
        &mut self,
        group: ItemId,
    ) -> Result<(Vec<ChatMessage>, Option<String>)> {
        let (index, _) = self
            .timeline
            .group(group)
            .ok_or(EngineError::ItemNotFound(group))?;
        let anchor = index.checked_sub(1).ok_or(EngineError::InvalidAnchor {
            index,
            found: "nothing",
        })?;
        let messages = self.prepare_messages(Some(anchor))?;
        Ok((messages, self.system_prompt.clone()))
    }
}

/// Call the client, folding every failure mode into the result.
///
/// Cancellation observed by the client wins over the engine's own
/// cancellation branch, so partial output is kept when the client returns it.
pub(crate) async fn invoke_client(
    client: &dyn ChatClient,
    messages: &[ChatMessage],
    system_prompt: Option<&str>,
    cancel: &CancellationToken,
) -> CompletionResult {
    let started = Instant::now();
    let outcome = tokio::select! {
        biased;
        result = client.send(messages, system_prompt, cancel.clone()) => result,
        _ = cancel.cancelled() => {
            Ok(CompletionResult::interrupted(Vec::new(), TokenUsage::default()))
        }
    };

    let mut result = match outcome {
        Ok(result) => result,
        Err(_) if cancel.is_cancelled() => {
            CompletionResult::interrupted(Vec::new(), TokenUsage::default())
        }
        Err(e) => CompletionResult::failed(e.to_string()),
    };
    if result.latency.is_zero() {
        result.latency = started.elapsed();
    }
    result
}

impl SessionHandle {
    /// Ask `client` for another answer to `group` and accept it.
    pub async fn new_candidate(
        &self,
        group: ItemId,
        client: Arc<dyn ChatClient>,
        cancel: CancellationToken,
    ) -> Result<CandidateId> {
        let _responding = self.responding().enter();

        let (messages, system_prompt) = self.lock().await.prepare_for_group(group)?;
        let source = client.identity();
        let result =
            invoke_client(client.as_ref(), &messages, system_prompt.as_deref(), &cancel).await;

        let mut session = self.lock().await;
        session.record_usage(result.usage, result.price);
        tracing::info!(
            session_id = %self.id(),
            group = %group,
            source = %source,
            finish = ?result.finish_state,
            tokens = result.usage.total(),
            "Candidate received"
        );

        let candidate = ResponseCandidate::from_completion(source, result);
        session.attach_candidate(group, candidate).inspect_err(|_| {
            tracing::warn!(
                session_id = %self.id(),
                group = %group,
                "Response group removed while its call was in flight; result discarded"
            );
        })
    }

    /// Regenerate the accepted candidate of `group` in place, through the
    /// client that produced it.
    pub async fn retry_accepted(
        &self,
        group: ItemId,
        cancel: CancellationToken,
    ) -> Result<CandidateId> {
        let _responding = self.responding().enter();

        let (candidate_id, source, preferred, messages, system_prompt) = {
            let mut session = self.lock().await;
            let (_, response) = session
                .timeline()
                .group(group)
                .ok_or(EngineError::ItemNotFound(group))?;
            let accepted = response.accepted().ok_or_else(|| {
                EngineError::Other(format!("Response group {} has no accepted candidate", group))
            })?;
            let (candidate_id, source) = (accepted.id, accepted.source.clone());
            let (messages, system_prompt) = session.prepare_for_group(group)?;
            let preferred = session.default_client().cloned();
            (candidate_id, source, preferred, messages, system_prompt)
        };

        let client = self
            .clients()
            .resolve_or(&source, preferred.as_ref())
            .ok_or_else(|| {
                EngineError::Configuration(format!("No client registered for {}", source))
            })?;
        let identity = client.identity();
        let result =
            invoke_client(client.as_ref(), &messages, system_prompt.as_deref(), &cancel).await;

        let mut session = self.lock().await;
        session.record_usage(result.usage, result.price);
        tracing::info!(
            session_id = %self.id(),
            group = %group,
            source = %identity,
            finish = ?result.finish_state,
            "Candidate regenerated"
        );
        session
            .refill_candidate(group, candidate_id, identity, result)
            .inspect_err(|_| {
                tracing::warn!(
                    session_id = %self.id(),
                    group = %group,
                    candidate = %candidate_id,
                    "Candidate removed while being regenerated; result discarded"
                );
            })?;
        Ok(candidate_id)
    }

    /// Submit a new turn and answer it with `client`.
    ///
    /// Returns the group id and the accepted candidate.
    pub async fn submit(
        &self,
        text: impl Into<String>,
        client: Arc<dyn ChatClient>,
        cancel: CancellationToken,
    ) -> Result<(ItemId, CandidateId)> {
        let (_, group) = self.lock().await.submit_turn(text);
        let candidate = self.new_candidate(group, client, cancel).await?;
        Ok((group, candidate))
    }
}
