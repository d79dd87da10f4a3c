//! Interaction Clipboard
//!
//! Moves a single turn (a request and its response group) within or across
//! sessions. The transport (OS clipboard, file, pipe) is the caller's
//! business; this module only produces and consumes the text form.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};
use crate::session::Session;
use crate::timeline::{ItemId, RequestTurn, ResponseGroup};

/// Version of the payload layout
pub const SCHEMA_VERSION: u32 = 1;

/// One exported turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionPayload {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestTurn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseGroup>,
    /// Truncated SHA-256 over both sections
    pub digest: String,
}

#[derive(Serialize)]
struct Sections<'a> {
    request: &'a Option<RequestTurn>,
    response: &'a Option<ResponseGroup>,
}

impl InteractionPayload {
    pub fn new(request: Option<RequestTurn>, response: Option<ResponseGroup>) -> Result<Self> {
        let digest = Self::compute_digest(&request, &response)?;
        Ok(Self {
            schema_version: SCHEMA_VERSION,
            request,
            response,
            digest,
        })
    }

    /// Serialize to the transfer text
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and verify the transfer text
    pub fn from_text(text: &str) -> Result<Self> {
        let payload: InteractionPayload = serde_json::from_str(text)
            .map_err(|e| EngineError::payload(format!("malformed payload: {}", e)))?;
        payload.validate()?;
        Ok(payload)
    }

    /// Check version, shape and digest
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(EngineError::payload(format!(
                "unsupported schema version {} (expected {})",
                self.schema_version, SCHEMA_VERSION
            )));
        }

        match (&self.request, &self.response) {
            (None, None) => return Err(EngineError::payload("payload has no sections")),
            (Some(request), Some(response)) if request.interaction_id != response.interaction_id => {
                return Err(EngineError::payload(
                    "request and response belong to different interactions",
                ));
            }
            _ => {}
        }

        if let Some(response) = &self.response {
            if !response.is_consistent() {
                return Err(EngineError::payload("response group is inconsistent"));
            }
        }

        let expected = Self::compute_digest(&self.request, &self.response)?;
        if expected != self.digest {
            return Err(EngineError::payload("digest mismatch"));
        }
        Ok(())
    }

    fn compute_digest(
        request: &Option<RequestTurn>,
        response: &Option<ResponseGroup>,
    ) -> Result<String> {
        // Going through Value sorts object keys
        let canonical = serde_json::to_value(Sections { request, response })?.to_string();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(format!("{:x}", hasher.finalize())[..16].to_string())
    }
}

/// Result of a paste
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    /// Items were inserted starting at `index`
    Inserted {
        index: usize,
        request: Option<ItemId>,
        response: Option<ItemId>,
    },
    /// An equal request already exists; nothing changed
    Duplicate,
}

/// Capture a response group and, when it sits right after it, its request
pub fn export_interaction(session: &Session, group: ItemId) -> Result<InteractionPayload> {
    let (index, response) = session
        .timeline()
        .group(group)
        .ok_or(EngineError::ItemNotFound(group))?;

    let request = index
        .checked_sub(1)
        .and_then(|i| session.items()[i].as_request())
        .filter(|request| request.interaction_id == response.interaction_id)
        .cloned();

    InteractionPayload::new(request, Some(response.clone()))
}

/// Paste a payload into `session` at `insert_index` (end when `None`).
///
/// A malformed payload is rejected before anything is touched.
pub fn import_interaction(
    session: &mut Session,
    payload: &InteractionPayload,
    insert_index: Option<usize>,
) -> Result<ImportOutcome> {
    payload.validate()?;

    if let Some(request) = &payload.request {
        let duplicate = session
            .items()
            .iter()
            .filter_map(|item| item.as_request())
            .any(|existing| existing.structurally_eq(request));
        if duplicate {
            tracing::info!(
                session_id = %session.id(),
                interaction = %request.interaction_id,
                "Paste skipped: interaction already present"
            );
            return Ok(ImportOutcome::Duplicate);
        }
    }

    let index = insert_index.unwrap_or(session.len());
    assert!(
        index <= session.len(),
        "insert index {} out of bounds (len {})",
        index,
        session.len()
    );

    let mut next = index;
    let request = payload.request.clone().map(|mut request| {
        if session.timeline().contains(request.id) {
            request.id = ItemId::new();
        }
        let id = request.id;
        session.insert_at(next, request.into());
        next += 1;
        id
    });
    let response = payload.response.clone().map(|mut response| {
        if session.timeline().contains(response.id) {
            response.id = ItemId::new();
        }
        let id = response.id;
        session.insert_at(next, response.into());
        id
    });

    tracing::info!(
        session_id = %session.id(),
        index,
        has_request = request.is_some(),
        has_response = response.is_some(),
        "Interaction pasted"
    );

    Ok(ImportOutcome::Inserted {
        index,
        request,
        response,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientIdentity, CompletionResult, TokenUsage};
    use crate::timeline::{ItemKind, ResponseCandidate};

    fn answered_session(question: &str, answer: &str) -> (Session, ItemId) {
        let mut session = Session::new("source");
        let (_, group) = session.submit_turn(question);
        let candidate = ResponseCandidate::from_completion(
            ClientIdentity::new("local", "echo"),
            CompletionResult::text(answer, TokenUsage::new(3, 2)).with_price(0.1),
        );
        session.attach_candidate(group, candidate).unwrap();
        (session, group)
    }

    #[test]
    fn test_round_trip_into_empty_session() {
        let (source, group) = answered_session("What is Rust?", "A language.");
        let text = export_interaction(&source, group).unwrap().to_text().unwrap();

        let payload = InteractionPayload::from_text(&text).unwrap();
        let mut target = Session::new("target");
        let outcome = import_interaction(&mut target, &payload, None).unwrap();
        assert!(matches!(outcome, ImportOutcome::Inserted { index: 0, .. }));

        assert_eq!(
            serde_json::to_string(target.items()).unwrap(),
            serde_json::to_string(source.items()).unwrap()
        );
    }

    #[test]
    fn test_paste_twice_inserts_once() {
        let (source, group) = answered_session("hello", "hi");
        let payload = export_interaction(&source, group).unwrap();

        let mut target = Session::new("target");
        import_interaction(&mut target, &payload, None).unwrap();
        let second = import_interaction(&mut target, &payload, None).unwrap();

        assert_eq!(second, ImportOutcome::Duplicate);
        assert_eq!(target.len(), 2);
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let (source, group) = answered_session("hello", "hi");
        let text = export_interaction(&source, group).unwrap().to_text().unwrap();
        let tampered = text.replace("hello", "goodbye");

        let err = InteractionPayload::from_text(&tampered).unwrap_err();
        assert!(err.is_payload());
    }

    #[test]
    fn test_truncated_payload_rejected_without_mutation() {
        let (source, group) = answered_session("hello", "hi");
        let text = export_interaction(&source, group).unwrap().to_text().unwrap();

        let err = InteractionPayload::from_text(&text[..text.len() / 2]).unwrap_err();
        assert!(err.is_payload());

        let mut target = Session::new("target");
        let mut payload = export_interaction(&source, group).unwrap();
        payload.schema_version = 99;
        assert!(import_interaction(&mut target, &payload, None).unwrap_err().is_payload());
        assert!(target.is_empty());
    }

    #[test]
    fn test_empty_and_mismatched_payloads() {
        let empty = InteractionPayload::new(None, None).unwrap();
        assert!(empty.validate().unwrap_err().is_payload());

        let request = RequestTurn::new("a");
        let group = ResponseGroup::new(RequestTurn::new("b").interaction_id);
        let mismatched = InteractionPayload::new(Some(request), Some(group)).unwrap();
        assert!(mismatched.validate().unwrap_err().is_payload());
    }

    #[test]
    fn test_response_only_paste_gets_fresh_id() {
        let (mut session, group) = answered_session("hello", "hi");
        let response = session.timeline().group(group).unwrap().1.clone();
        let payload = InteractionPayload::new(None, Some(response)).unwrap();

        let outcome = import_interaction(&mut session, &payload, None).unwrap();
        let ImportOutcome::Inserted {
            response: Some(pasted),
            ..
        } = outcome
        else {
            panic!("expected insertion");
        };
        assert_ne!(pasted, group);
        assert_eq!(session.items()[2].kind(), ItemKind::ResponseGroup);
        // The orphaned group stays out of the replay
        session.append(RequestTurn::new("next").into());
        let replay = session.resolve_context(None).unwrap();
        let ids: Vec<_> = replay.iter().map(|i| i.id()).collect();
        assert_eq!(ids, vec![session.items()[0].id(), group, session.items()[3].id()]);
    }

    #[test]
    fn test_export_without_adjacent_request() {
        let (mut session, group) = answered_session("hello", "hi");
        session.insert_erase_marker(Some(1));

        let payload = export_interaction(&session, group).unwrap();
        assert!(payload.request.is_none());
        assert!(payload.response.is_some());
    }
}
