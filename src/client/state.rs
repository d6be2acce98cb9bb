//! Per-field save state.
//!
//! ```text
//! Idle --edit--> Dirty --debounce--> Queued --dispatch--> InFlight --ack--> Idle
//!                  ^                                         |
//!                  +------------- ack (newer edit) ----------+
//!                                                            |
//!                           Failed <------ send failed ------+
//!                             |  --parked retry--> Queued
//! ```
//!
//! Transitions are pure; the queue driver owns timers and I/O and only moves
//! a field when [`FieldState::on`] allows it.

use crate::core::{FieldUpdate, Section};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldState {
    Idle,
    Dirty,
    Queued,
    InFlight,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldEvent {
    Edited,
    Enqueued,
    Dispatched,
    Acked,
    /// Acked, but the field was edited again while the request was out.
    AckedStale,
    SendFailed,
    /// The character context was torn down; forget the pending value.
    Discarded,
}

impl FieldState {
    pub fn on(self, event: FieldEvent) -> Option<FieldState> {
        use FieldEvent::*;
        use FieldState::*;

        match (self, event) {
            (_, Discarded) => Some(Idle),
            (InFlight, Edited) => Some(InFlight),
            (_, Edited) => Some(Dirty),
            (Dirty | Failed, Enqueued) => Some(Queued),
            (Queued, Dispatched) => Some(InFlight),
            (InFlight, Acked) => Some(Idle),
            (InFlight, AckedStale) => Some(Dirty),
            (InFlight, SendFailed) => Some(Failed),
            _ => None,
        }
    }

    /// Holds a value the server has not confirmed.
    pub fn is_pending(self) -> bool {
        !matches!(self, FieldState::Idle)
    }
}

impl fmt::Display for FieldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldState::Idle => "idle",
            FieldState::Dirty => "dirty",
            FieldState::Queued => "queued",
            FieldState::InFlight => "in-flight",
            FieldState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Identity of an editable field on the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldKey {
    pub character: String,
    pub section: Section,
    pub field: String,
    pub index: Option<usize>,
}

impl FieldKey {
    pub fn new(character: impl Into<String>, section: Section, field: impl Into<String>) -> Self {
        Self {
            character: character.into(),
            section,
            field: field.into(),
            index: None,
        }
    }

    pub fn at(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    /// List-item fields get the longer debounce.
    pub fn is_list_item(&self) -> bool {
        self.index.is_some()
    }

    pub fn to_update(&self, value: Value) -> FieldUpdate {
        FieldUpdate {
            section: self.section,
            field: self.field.clone(),
            value,
            index: self.index,
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.character, self.section, self.field)?;
        if let Some(index) = self.index {
            write!(f, "[{}]", index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::FieldEvent::*;
    use super::FieldState::*;
    use super::*;

    #[test]
    fn happy_path_returns_to_idle() {
        let state = Idle.on(Edited).unwrap();
        let state = state.on(Enqueued).unwrap();
        let state = state.on(Dispatched).unwrap();
        assert_eq!(state.on(Acked), Some(Idle));
    }

    #[test]
    fn edits_during_flight_keep_the_request_alive() {
        assert_eq!(InFlight.on(Edited), Some(InFlight));
        assert_eq!(InFlight.on(AckedStale), Some(Dirty));
    }

    #[test]
    fn edits_pull_queued_and_failed_fields_back_to_dirty() {
        assert_eq!(Queued.on(Edited), Some(Dirty));
        assert_eq!(Failed.on(Edited), Some(Dirty));
        assert_eq!(Failed.on(Enqueued), Some(Queued));
    }

    #[test]
    fn rejects_impossible_transitions() {
        assert_eq!(Idle.on(Acked), None);
        assert_eq!(Dirty.on(Dispatched), None);
        assert_eq!(InFlight.on(Enqueued), None);
        assert_eq!(Queued.on(Enqueued), None);
        assert_eq!(Queued.on(Discarded), Some(Idle));
    }

    #[test]
    fn key_display_includes_index() {
        let key = FieldKey::new("frunk", Section::Clubs, "name").at(2);
        assert_eq!(key.to_string(), "frunk.clubs.name[2]");
        assert!(key.is_list_item());
    }
}
