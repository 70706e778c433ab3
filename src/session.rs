//! Per-call state: lifecycle, mute preferences, recent user turns and the call timer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

/// Call lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Ringing,
    Greeting,
    Recording,
    Uploading,
    Playing,
    Ended,
}

impl CallState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Ended, _) => false,
            (_, Ended) => true,
            (Idle, Ringing) => true,
            (Ringing, Greeting) => true,
            (Greeting, Recording) => true,
            // An empty capture re-arms recording in place.
            (Recording, Recording) | (Recording, Uploading) => true,
            (Uploading, Playing) | (Uploading, Recording) => true,
            (Playing, Recording) => true,
            _ => false,
        }
    }

    /// A call is in progress in every state but Idle and Ended.
    pub fn is_active(self) -> bool {
        !matches!(self, CallState::Idle | CallState::Ended)
    }

    /// Whether the microphone is in use in this state.
    pub fn uses_mic(self) -> bool {
        matches!(self, CallState::Recording | CallState::Playing)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid call state transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: CallState,
    pub to: CallState,
}

/// Bounded history of the user's recent utterances.
#[derive(Debug, Clone)]
pub struct RecentTurns {
    turns: VecDeque<String>,
    capacity: usize,
}

impl RecentTurns {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            turns: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a non-empty utterance, evicting the oldest beyond capacity.
    pub fn push(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if self.turns.len() == self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(text.to_string());
    }

    /// The last `n` utterances, oldest first.
    pub fn last(&self, n: usize) -> Vec<String> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Handle to audio owned by the session (an object URL or playback id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AudioHandle(pub String);

/// One call from start to end.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: Uuid,
    state: CallState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub mic_muted: bool,
    pub speaker_muted: bool,
    pub preferred_output_device_id: Option<String>,
    pub recent_user_turns: RecentTurns,
    managed_audio: HashSet<AudioHandle>,
    pub turns_recorded: usize,
    pub replies_completed: usize,
    pub replies_interrupted: usize,
}

impl CallSession {
    pub fn new(recent_capacity: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: CallState::Idle,
            started_at: Utc::now(),
            ended_at: None,
            mic_muted: false,
            speaker_muted: false,
            preferred_output_device_id: None,
            recent_user_turns: RecentTurns::new(recent_capacity),
            managed_audio: HashSet::new(),
            turns_recorded: 0,
            replies_completed: 0,
            replies_interrupted: 0,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_ended(&self) -> bool {
        self.state == CallState::Ended
    }

    pub fn transition(&mut self, next: CallState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        log::debug!("Call {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        if next == CallState::Ended {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn track_audio(&mut self, handle: AudioHandle) {
        self.managed_audio.insert(handle);
    }

    pub fn release_audio(&mut self, handle: &AudioHandle) -> bool {
        self.managed_audio.remove(handle)
    }

    /// Take every tracked handle, leaving none.
    pub fn drain_audio(&mut self) -> Vec<AudioHandle> {
        self.managed_audio.drain().collect()
    }

    pub fn managed_audio_count(&self) -> usize {
        self.managed_audio.len()
    }

    /// Elapsed call time, frozen once the call ends.
    pub fn elapsed(&self) -> chrono::Duration {
        self.ended_at.unwrap_or_else(Utc::now) - self.started_at
    }

    pub fn elapsed_display(&self) -> String {
        format_elapsed(self.elapsed().num_seconds())
    }
}

/// `mm:ss`, with minutes growing past two digits as needed.
pub fn format_elapsed(total_seconds: i64) -> String {
    let total = total_seconds.max(0);
    format!("{:02}:{:02}", total / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut session = CallSession::new(12);
        for next in [
            CallState::Ringing,
            CallState::Greeting,
            CallState::Recording,
            CallState::Uploading,
            CallState::Playing,
            CallState::Recording,
            CallState::Recording,
            CallState::Uploading,
            CallState::Recording,
            CallState::Ended,
        ] {
            session.transition(next).unwrap();
        }
        assert!(session.is_ended());
        assert!(session.ended_at.is_some());
    }

    #[test]
    fn test_ended_is_terminal() {
        let mut session = CallSession::new(12);
        session.transition(CallState::Ended).unwrap();
        let err = session.transition(CallState::Recording).unwrap_err();
        assert_eq!(err.from, CallState::Ended);
        assert!(session.transition(CallState::Ended).is_err());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        assert!(!CallState::Idle.can_transition_to(CallState::Recording));
        assert!(!CallState::Playing.can_transition_to(CallState::Uploading));
        assert!(!CallState::Greeting.can_transition_to(CallState::Playing));
        assert!(CallState::Greeting.can_transition_to(CallState::Ended));
    }

    #[test]
    fn test_recent_turns_evicts_oldest() {
        let mut recent = RecentTurns::new(12);
        for i in 0..15 {
            recent.push(&format!("turn {}", i));
        }
        recent.push("   ");
        assert_eq!(recent.len(), 12);
        assert_eq!(recent.last(3), vec!["turn 12", "turn 13", "turn 14"]);
        assert_eq!(recent.last(100).first().map(String::as_str), Some("turn 3"));
    }

    #[test]
    fn test_managed_audio_tracking() {
        let mut session = CallSession::new(12);
        let a = AudioHandle("blob:a".into());
        session.track_audio(a.clone());
        session.track_audio(AudioHandle("blob:b".into()));
        assert!(session.release_audio(&a));
        assert!(!session.release_audio(&a));
        assert_eq!(session.drain_audio().len(), 1);
        assert_eq!(session.managed_audio_count(), 0);
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(0), "00:00");
        assert_eq!(format_elapsed(65), "01:05");
        assert_eq!(format_elapsed(3600), "60:00");
        assert_eq!(format_elapsed(-5), "00:00");
    }
}
