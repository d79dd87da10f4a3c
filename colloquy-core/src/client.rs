//! Chat client collaborator
//!
//! The engine's only I/O boundary. Implementors wrap whatever transport or SDK
//! actually talks to a model; the engine hands them an ordered message list
//! and a system prompt and receives a [`CompletionResult`] back.
//!
//! Transport failures returned as `Err` never escape the branch manager: they
//! are captured into [`FinishState::Error`](crate::timeline::FinishState) on
//! the resulting candidate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::timeline::FinishState;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Reference to content attached to a request.
///
/// Only the reference travels through the engine; byte caching belongs to the
/// caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub media_type: String,
    pub uri: String,
}

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Identity of the model/endpoint that produced a candidate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub provider: String,
    pub model: String,
}

impl ClientIdentity {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

impl FromStr for ClientIdentity {
    type Err = EngineError;

    /// Parse the `provider/model` form used in configuration
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
                Ok(Self::new(provider, model))
            }
            _ => Err(EngineError::Configuration(format!(
                "Client identity must look like provider/model, got {:?}",
                s
            ))),
        }
    }
}

/// Outcome of a single model call
#[derive(Debug, Clone)]
pub struct CompletionResult {
    /// Messages produced by the model, in order
    pub messages: Vec<ChatMessage>,
    /// How the call ended
    pub finish_state: FinishState,
    /// Billed usage, including partial usage for interrupted calls
    pub usage: TokenUsage,
    /// Price of the call
    pub price: f64,
    /// Wall-clock latency
    pub latency: Duration,
}

impl CompletionResult {
    /// A completed single-message answer
    pub fn text(content: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            messages: vec![ChatMessage::assistant(content)],
            finish_state: FinishState::Ok,
            usage,
            price: 0.0,
            latency: Duration::ZERO,
        }
    }

    /// A call that stopped before completing
    pub fn interrupted(messages: Vec<ChatMessage>, usage: TokenUsage) -> Self {
        Self {
            messages,
            finish_state: FinishState::Interrupted,
            usage,
            price: 0.0,
            latency: Duration::ZERO,
        }
    }

    /// A call that failed outright
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            messages: Vec::new(),
            finish_state: FinishState::Error {
                reason: reason.into(),
            },
            usage: TokenUsage::default(),
            price: 0.0,
            latency: Duration::ZERO,
        }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = price;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

/// Trait for chat client implementations.
///
/// Implementors must observe `cancel` and return promptly once it fires,
/// preferably with [`FinishState::Interrupted`] and whatever was already
/// produced.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Identity recorded as the source of produced candidates
    fn identity(&self) -> ClientIdentity;

    /// Send the replay list and return the model's answer
    async fn send(
        &self,
        context: &[ChatMessage],
        system_prompt: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<CompletionResult>;
}

/// Client that refuses every call.
///
/// Used where a registry has no client for a candidate's source.
pub struct StubClient;

#[async_trait]
impl ChatClient for StubClient {
    fn identity(&self) -> ClientIdentity {
        ClientIdentity::new("stub", "none")
    }

    async fn send(
        &self,
        _context: &[ChatMessage],
        _system_prompt: Option<&str>,
        _cancel: CancellationToken,
    ) -> Result<CompletionResult> {
        Err(EngineError::Client(
            "No chat client configured. Implement the ChatClient trait for your backend"
                .to_string(),
        ))
    }
}

/// Offline client that answers with the last user message.
pub struct EchoClient {
    model: String,
}

impl EchoClient {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }
}

impl Default for EchoClient {
    fn default() -> Self {
        Self::new("echo")
    }
}

#[async_trait]
impl ChatClient for EchoClient {
    fn identity(&self) -> ClientIdentity {
        ClientIdentity::new("local", self.model.clone())
    }

    async fn send(
        &self,
        context: &[ChatMessage],
        _system_prompt: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<CompletionResult> {
        let started = std::time::Instant::now();
        if cancel.is_cancelled() {
            return Ok(CompletionResult::interrupted(Vec::new(), TokenUsage::default()));
        }

        let last = context
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let prompt_chars: usize = context.iter().map(|m| m.content.len()).sum();
        let usage = TokenUsage::new((prompt_chars / 4) as u64, (last.len() / 4) as u64);

        Ok(CompletionResult::text(last, usage).with_latency(started.elapsed()))
    }
}

/// Named chat clients.
///
/// Lets callers re-run a candidate through the client that produced it.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientIdentity, Arc<dyn ChatClient>>,
    default: Option<ClientIdentity>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client under its own identity
    pub fn register(&mut self, client: Arc<dyn ChatClient>) -> ClientIdentity {
        let identity = client.identity();
        if self.default.is_none() {
            self.default = Some(identity.clone());
        }
        self.clients.insert(identity.clone(), client);
        identity
    }

    /// Builder: register and return self
    pub fn with_client(mut self, client: Arc<dyn ChatClient>) -> Self {
        self.register(client);
        self
    }

    /// Set which registered client answers when no exact match exists
    pub fn set_default(&mut self, identity: ClientIdentity) -> Result<()> {
        if !self.clients.contains_key(&identity) {
            return Err(EngineError::Configuration(format!(
                "Unknown default client: {}",
                identity
            )));
        }
        self.default = Some(identity);
        Ok(())
    }

    pub fn get(&self, identity: &ClientIdentity) -> Option<Arc<dyn ChatClient>> {
        self.clients.get(identity).cloned()
    }

    /// Look up `identity`, falling back to the default client
    pub fn resolve(&self, identity: &ClientIdentity) -> Option<Arc<dyn ChatClient>> {
        self.get(identity).or_else(|| {
            self.default
                .as_ref()
                .and_then(|default| self.clients.get(default).cloned())
        })
    }

    /// Like [`resolve`](Self::resolve), but tries `preferred` before the
    /// registry's own default
    pub fn resolve_or(
        &self,
        identity: &ClientIdentity,
        preferred: Option<&ClientIdentity>,
    ) -> Option<Arc<dyn ChatClient>> {
        self.get(identity)
            .or_else(|| preferred.and_then(|preferred| self.get(preferred)))
            .or_else(|| self.default_client())
    }

    pub fn default_client(&self) -> Option<Arc<dyn ChatClient>> {
        self.default
            .as_ref()
            .and_then(|default| self.clients.get(default).cloned())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.clients.keys().collect::<Vec<_>>())
            .field("default", &self.default)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stub_client() {
        let result = StubClient
            .send(&[], None, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(EngineError::Client(_))));
    }

    #[tokio::test]
    async fn test_echo_client_repeats_last_user_message() {
        let client = EchoClient::default();
        let context = vec![
            ChatMessage::user("first"),
            ChatMessage::assistant("ignored"),
            ChatMessage::user("second question"),
        ];

        let result = client
            .send(&context, Some("be brief"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.finish_state, FinishState::Ok);
        assert_eq!(result.messages[0].content, "second question");
        assert_eq!(result.messages[0].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn test_echo_client_honors_cancellation() {
        let token = CancellationToken::new();
        token.cancel();

        let result = EchoClient::default()
            .send(&[ChatMessage::user("hi")], None, token)
            .await
            .unwrap();
        assert_eq!(result.finish_state, FinishState::Interrupted);
    }

    #[test]
    fn test_registry_resolve_falls_back_to_default() {
        let registry = ClientRegistry::new()
            .with_client(Arc::new(EchoClient::new("a")))
            .with_client(Arc::new(EchoClient::new("b")));

        let b = ClientIdentity::new("local", "b");
        assert_eq!(registry.resolve(&b).unwrap().identity(), b);

        let unknown = ClientIdentity::new("remote", "gone");
        assert_eq!(
            registry.resolve(&unknown).unwrap().identity(),
            ClientIdentity::new("local", "a")
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_rejects_unknown_default() {
        let mut registry = ClientRegistry::new();
        assert!(registry.set_default(ClientIdentity::new("x", "y")).is_err());
    }

    #[test]
    fn test_resolve_or_prefers_given_identity() {
        let registry = ClientRegistry::new()
            .with_client(Arc::new(EchoClient::new("a")))
            .with_client(Arc::new(EchoClient::new("b")));
        let unknown = ClientIdentity::new("remote", "gone");
        let b = ClientIdentity::new("local", "b");

        assert_eq!(registry.resolve_or(&unknown, Some(&b)).unwrap().identity(), b);
        // An unregistered preference falls through to the registry default
        assert_eq!(
            registry
                .resolve_or(&unknown, Some(&ClientIdentity::new("x", "y")))
                .unwrap()
                .identity(),
            ClientIdentity::new("local", "a")
        );
    }

    #[test]
    fn test_identity_parse() {
        let parsed: ClientIdentity = "local/echo".parse().unwrap();
        assert_eq!(parsed, ClientIdentity::new("local", "echo"));
        assert!("echo".parse::<ClientIdentity>().is_err());
        assert!("/echo".parse::<ClientIdentity>().is_err());
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(ClientIdentity::new("openai", "gpt").to_string(), "openai/gpt");
    }
}
