//! Derived session state
//!
//! Recomputed explicitly by the session after each mutation rather than
//! tracked incrementally.

use serde::{Deserialize, Serialize};

use crate::timeline::{Timeline, TimelineItem};

const SHORTCUT_CHARS: usize = 40;

/// Values derived from the timeline, cached for display
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedState {
    /// Preview of the first request
    pub shortcut: String,
    /// Tokens a new request appended at the end would carry as history
    pub current_context_tokens: u64,
    /// Number of requests in the timeline
    pub turn_count: usize,
}

impl DerivedState {
    pub fn compute(timeline: &Timeline) -> Self {
        let shortcut = timeline
            .iter()
            .find_map(|item| item.as_request())
            .map(|r| shortcut_of(&r.text))
            .unwrap_or_default();

        let current_context_tokens = timeline
            .history_indices(timeline.len())
            .into_iter()
            .map(|i| match &timeline.items()[i] {
                TimelineItem::Request(request) => request.estimated_tokens,
                TimelineItem::Response(group) => group
                    .accepted()
                    .map(|c| c.usage.completion_tokens)
                    .unwrap_or(0),
                TimelineItem::Erase(_) => 0,
            })
            .sum();

        let turn_count = timeline.iter().filter(|i| i.as_request().is_some()).count();

        Self {
            shortcut,
            current_context_tokens,
            turn_count,
        }
    }
}

fn shortcut_of(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= SHORTCUT_CHARS {
        line.to_string()
    } else {
        let mut short: String = line.chars().take(SHORTCUT_CHARS).collect();
        short.push('…');
        short
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::{EraseMarker, RequestTurn};

    #[test]
    fn test_shortcut_truncates_first_line() {
        assert_eq!(shortcut_of("short\nsecond line"), "short");
        let long = "x".repeat(50);
        let short = shortcut_of(&long);
        assert_eq!(short.chars().count(), SHORTCUT_CHARS + 1);
        assert!(short.ends_with('…'));
    }

    #[test]
    fn test_context_tokens_stop_at_erase() {
        let mut timeline = Timeline::new();
        timeline.append(RequestTurn::new("ignored").with_estimated_tokens(7).into());
        timeline.append(EraseMarker::new().into());

        let derived = DerivedState::compute(&timeline);
        assert_eq!(derived.current_context_tokens, 0);
        assert_eq!(derived.turn_count, 1);
        assert_eq!(derived.shortcut, "ignored");
    }
}
