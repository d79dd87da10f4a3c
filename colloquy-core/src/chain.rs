//! Chain Runner
//!
//! Replays the request-like items of an existing timeline prefix as a fresh,
//! strictly sequential batch, typically against a different model. Each step
//! appends a copy of the original request, so step N+1 sees step N's
//! accepted answer in its context.
//!
//! An interrupted answer is discarded and the step retried, up to
//! [`ChainConfig::max_attempts`]. Completed steps are never rolled back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::branch::invoke_client;
use crate::client::ChatClient;
use crate::error::{EngineError, Result};
use crate::session::SessionHandle;
use crate::timeline::{
    InteractionId, ItemId, RequestTurn, ResponseCandidate, ResponseGroup, TimelineItem,
};

/// Configuration for chain execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Attempts per step before the run aborts
    pub max_attempts: u32,
    /// Delay before the first retry of a step
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Maximum delay between retries
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::ZERO,
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl ChainConfig {
    /// Builder: set max attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Builder: set initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Delay before retry number `retry` of a step (0 is the first retry)
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.max(1.0).powi(retry as i32);
        let clamped = base.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(clamped as u64)
    }
}

/// Progress of a chain run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChainState {
    Idle,
    Running { step: usize, total_steps: usize },
    Completed { total_steps: usize },
    Aborted { step: usize, reason: String },
}

/// Summary of a finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainReport {
    pub total_steps: usize,
    pub steps_completed: usize,
    /// Model calls made per step (0 for erase markers)
    pub attempts_per_step: Vec<u32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// A request-like item to replay
#[derive(Debug, Clone)]
enum ChainSource {
    Erase,
    Request(RequestTurn),
}

impl ChainSource {
    fn from_item(item: &TimelineItem) -> Option<Self> {
        match item {
            TimelineItem::Erase(_) => Some(ChainSource::Erase),
            TimelineItem::Request(request) => Some(ChainSource::Request(request.clone())),
            TimelineItem::Response(_) => None,
        }
    }
}

/// Sequential re-execution of a timeline prefix
pub struct ChainRunner {
    handle: SessionHandle,
    client: Arc<dyn ChatClient>,
    config: ChainConfig,
    state: watch::Sender<ChainState>,
}

impl std::fmt::Debug for ChainRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainRunner")
            .field("session", &self.handle.id())
            .field("client", &self.client.identity())
            .field("config", &self.config)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl ChainRunner {
    pub fn new(handle: SessionHandle, client: Arc<dyn ChatClient>) -> Self {
        let (state, _) = watch::channel(ChainState::Idle);
        Self {
            handle,
            client,
            config: ChainConfig::default(),
            state,
        }
    }

    pub fn with_config(mut self, config: ChainConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn state(&self) -> ChainState {
        self.state.borrow().clone()
    }

    /// Watch the run's progress
    pub fn subscribe(&self) -> watch::Receiver<ChainState> {
        self.state.subscribe()
    }

    /// Replay the request-like items found in `range` of the session
    pub async fn run(&self, range: Range<usize>, cancel: CancellationToken) -> Result<ChainReport> {
        let items = {
            let session = self.handle.lock().await;
            session.items()[range].to_vec()
        };
        self.run_items(&items, cancel).await
    }

    /// Replay the request-like items of `items`, in order
    pub async fn run_items(
        &self,
        items: &[TimelineItem],
        cancel: CancellationToken,
    ) -> Result<ChainReport> {
        let _responding = self.handle.responding().enter();
        let sources: Vec<ChainSource> = items.iter().filter_map(ChainSource::from_item).collect();
        let total_steps = sources.len();
        let started_at = Utc::now();
        let mut attempts_per_step = Vec::with_capacity(total_steps);

        tracing::info!(
            session_id = %self.handle.id(),
            client = %self.client.identity(),
            total_steps,
            "Chain run started"
        );

        for (step, source) in sources.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(self.abort(step, EngineError::ChainCancelled { step }));
            }
            self.state.send_replace(ChainState::Running { step, total_steps });

            match source {
                ChainSource::Erase => {
                    self.handle.lock().await.insert_erase_marker(None);
                    attempts_per_step.push(0);
                }
                ChainSource::Request(template) => {
                    let used = self.run_request_step(step, &template, &cancel).await?;
                    attempts_per_step.push(used);
                }
            }
        }

        self.state.send_replace(ChainState::Completed { total_steps });
        tracing::info!(
            session_id = %self.handle.id(),
            total_steps,
            "Chain run completed"
        );

        Ok(ChainReport {
            total_steps,
            steps_completed: total_steps,
            attempts_per_step,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Run one request step, returning the number of attempts it took.
    ///
    /// Any failure removes the step's request and aborts the run.
    async fn run_request_step(
        &self,
        step: usize,
        template: &RequestTurn,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let request = template.clone_content();
        let request_id = request.id;
        let interaction_id = request.interaction_id;
        let (_, group) = self.handle.lock().await.submit_request(request);

        match self.attempt_step(step, interaction_id, group, cancel).await {
            Ok(attempts) => Ok(attempts),
            Err(e) => {
                self.discard_step(request_id).await;
                Err(self.abort(step, e))
            }
        }
    }

    async fn attempt_step(
        &self,
        step: usize,
        interaction_id: InteractionId,
        mut group: ItemId,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        for attempt in 1..=self.config.max_attempts {
            if attempt > 1 {
                let delay = self.config.delay_for_attempt(attempt - 2);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if cancel.is_cancelled() {
                    return Err(EngineError::ChainCancelled { step });
                }
                let fresh = ResponseGroup::new(interaction_id);
                group = fresh.id;
                self.handle.lock().await.append(fresh.into());
            }

            let (messages, system_prompt) = self.handle.lock().await.prepare_for_group(group)?;
            let result = invoke_client(
                self.client.as_ref(),
                &messages,
                system_prompt.as_deref(),
                cancel,
            )
            .await;

            let mut session = self.handle.lock().await;
            session.record_usage(result.usage, result.price);

            if result.finish_state.is_interrupted() {
                session.delete_item(group)?;
                if cancel.is_cancelled() {
                    return Err(EngineError::ChainCancelled { step });
                }
                tracing::warn!(
                    session_id = %self.handle.id(),
                    step,
                    attempt,
                    max_attempts = self.config.max_attempts,
                    "Chain step interrupted; discarding answer"
                );
                continue;
            }

            let candidate = ResponseCandidate::from_completion(self.client.identity(), result);
            session.attach_candidate(group, candidate)?;
            tracing::debug!(session_id = %self.handle.id(), step, attempt, "Chain step completed");
            return Ok(attempt);
        }

        Err(EngineError::RetryExhausted {
            step,
            attempts: self.config.max_attempts,
        })
    }

    /// Remove the request of a step that never completed
    async fn discard_step(&self, request_id: ItemId) {
        if let Err(e) = self.handle.lock().await.delete_item(request_id) {
            tracing::warn!(session_id = %self.handle.id(), "Failed to discard chain step: {}", e);
        }
    }

    fn abort(&self, step: usize, error: EngineError) -> EngineError {
        tracing::warn!(session_id = %self.handle.id(), step, error = %error, "Chain run aborted");
        self.state.send_replace(ChainState::Aborted {
            step,
            reason: error.to_string(),
        });
        error
    }
}
