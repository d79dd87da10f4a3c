//! # Colloquy - A Branching Conversation Engine
//!
//! Colloquy keeps the timeline of a conversation with a language model and
//! works out, from any point in it, exactly which messages must be replayed
//! to the model. It handles:
//! - Multiple candidate answers per turn, one of them accepted
//! - Erase markers that cut the replayed history
//! - Regeneration, retry and session forking
//! - Sequential re-execution of a conversation prefix ("chains")
//! - Copy/paste of single turns within or across sessions
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use colloquy_core::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client: Arc<dyn ChatClient> = Arc::new(EchoClient::default());
//!     let registry = ClientRegistry::new().with_client(client.clone());
//!
//!     let session = Session::new("Trip planning").with_system_prompt("Be concise");
//!     let handle = SessionHandle::new(session, registry);
//!
//!     let (_, candidate) = handle
//!         .submit("Where should I go in May?", client, CancellationToken::new())
//!         .await?;
//!     println!("accepted {}", candidate);
//!
//!     let session = handle.lock().await;
//!     println!("{} tokens of context", session.derived().current_context_tokens);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Timeline**: the item sequence and its change notifications
//! - **Context resolver**: backward scan producing the replay list
//! - **Branch manager**: candidate creation, switching, retry and removal
//! - **Chain runner**: strictly sequential replay of a prefix
//! - **Clipboard**: verified transfer of one interaction
//!
//! The model transport, token counting and persistence format sit behind the
//! [`client::ChatClient`], [`tokens::TokenEstimator`] and
//! [`store::SessionStore`] traits.

pub mod branch;
pub mod chain;
pub mod client;
pub mod clipboard;
pub mod config;
pub mod context;
pub mod error;
pub mod session;
pub mod store;
pub mod timeline;
pub mod tokens;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::chain::{ChainConfig, ChainReport, ChainRunner, ChainState};
    pub use crate::client::{
        Attachment, ChatClient, ChatMessage, ClientIdentity, ClientRegistry, CompletionResult,
        EchoClient, MessageRole, StubClient, TokenUsage,
    };
    pub use crate::clipboard::{
        ImportOutcome, InteractionPayload, export_interaction, import_interaction,
    };
    pub use crate::config::{EngineConfig, EstimatorConfig, StoreConfig};
    pub use crate::context::to_messages;
    pub use crate::error::{EngineError, Result};
    pub use crate::session::{DerivedState, RespondingGuard, Session, SessionHandle};
    pub use crate::store::{
        InMemoryStore, JsonFileStore, SessionSnapshot, SessionStore, SessionSummary,
    };
    pub use crate::timeline::{
        CandidateId, EraseMarker, FinishState, InteractionId, ItemId, ItemKind, RequestTurn,
        ResponseCandidate, ResponseGroup, Timeline, TimelineEvent, TimelineItem,
        TimelineNotification, ToolConfig,
    };
    pub use crate::tokens::{CharRatioEstimator, TokenEstimator};
    pub use tokio_util::sync::CancellationToken;
}
