//! Voting window state machine.
//!
//! One machine per event, `Closed -> Open -> Closed`, advanced by ticks
//! carrying an explicit `now`. The machine only reports transitions; the
//! session reacts to them by retiring and installing vote ledgers.

use chrono::{DateTime, Utc};

use m4e_shared::schedule::{EventSchedule, VotingWindow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VotingState {
    #[default]
    Closed,
    Open(VotingWindow),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Started(VotingWindow),
    Ended(VotingWindow),
}

#[derive(Debug, Clone, Default)]
pub struct VotingMachine {
    state: VotingState,
}

impl VotingMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> VotingState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, VotingState::Open(_))
    }

    pub fn window(&self) -> Option<VotingWindow> {
        match self.state {
            VotingState::Open(window) => Some(window),
            VotingState::Closed => None,
        }
    }

    /// Re-evaluate against `schedule` at `now`.
    ///
    /// Leaving one window and entering the next within a single tick yields
    /// `Ended` followed by `Started`.
    pub fn tick(&mut self, now: DateTime<Utc>, schedule: &EventSchedule) -> Vec<Transition> {
        let current = schedule.window_at(now);
        let transitions = match (self.state, current) {
            (VotingState::Closed, None) => vec![],
            (VotingState::Closed, Some(window)) => vec![Transition::Started(window)],
            (VotingState::Open(open), Some(window)) if open == window => vec![],
            (VotingState::Open(open), Some(window)) => {
                vec![Transition::Ended(open), Transition::Started(window)]
            }
            (VotingState::Open(open), None) => vec![Transition::Ended(open)],
        };

        self.state = match current {
            Some(window) => VotingState::Open(window),
            None => VotingState::Closed,
        };
        transitions
    }
}
