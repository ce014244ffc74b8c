//! Partial transcript text for the current turn, one buffer per speaker.

use crate::transport::Speaker;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TranscriptTurn {
    pub user: String,
    pub agent: String,
}

impl TranscriptTurn {
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.agent.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct TranscriptAggregator {
    turn: TranscriptTurn,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta. Deltas arrive with their own spacing, so they are concatenated as-is.
    pub fn push(&mut self, speaker: Speaker, text: &str) {
        match speaker {
            Speaker::User => self.turn.user.push_str(text),
            Speaker::Agent => self.turn.agent.push_str(text),
        }
    }

    /// Barge-in: whatever the agent was saying is abandoned. The user's words stay.
    pub fn interrupt(&mut self) {
        self.turn.agent.clear();
    }

    /// Turn boundary.
    pub fn reset(&mut self) {
        self.turn = TranscriptTurn::default();
    }

    pub fn snapshot(&self) -> TranscriptTurn {
        self.turn.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deltas_accumulate_per_speaker() {
        let mut transcript = TranscriptAggregator::new();
        transcript.push(Speaker::User, "What's the ");
        transcript.push(Speaker::Agent, "Let me");
        transcript.push(Speaker::User, "weather?");
        transcript.push(Speaker::Agent, " check.");

        let turn = transcript.snapshot();
        assert_eq!(turn.user, "What's the weather?");
        assert_eq!(turn.agent, "Let me check.");
    }

    #[test]
    fn test_interrupt_clears_agent_only() {
        let mut transcript = TranscriptAggregator::new();
        transcript.push(Speaker::User, "Stop");
        transcript.push(Speaker::Agent, "The shipment is");
        transcript.interrupt();

        assert_eq!(transcript.snapshot().user, "Stop");
        assert!(transcript.snapshot().agent.is_empty());

        transcript.reset();
        assert!(transcript.snapshot().is_empty());
    }
}
