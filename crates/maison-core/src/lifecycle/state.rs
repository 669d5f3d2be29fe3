//! States, decision results and the transition table.

use core::fmt;

use crate::persistence::PersistentState;

/// States of the event lifecycle.
///
/// Discriminants are bit flags so sets of states can be tested with a mask;
/// they are also the values stored in the sleep-retaining memory.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Startup = 1,
    WaitForEvent = 2,
    ProcessEvent = 4,
    WaitEndEvent = 8,
    EndEvent = 16,
    /// Side-trip taken once every 24 hours, then back to `return_state`.
    Hours24 = 32,
}

/// States in which a battery-powered node brings the radio up.
const NETWORK_STATES: u8 = State::Startup as u8
    | State::ProcessEvent as u8
    | State::EndEvent as u8
    | State::Hours24 as u8;

/// States in which the node sleeps only briefly.
const SHORT_SLEEP_STATES: u8 =
    State::ProcessEvent as u8 | State::WaitEndEvent as u8 | State::EndEvent as u8;

impl State {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Startup => "STARTUP",
            Self::WaitForEvent => "WAIT_FOR_EVENT",
            Self::ProcessEvent => "PROCESS_EVENT",
            Self::WaitEndEvent => "WAIT_END_EVENT",
            Self::EndEvent => "END_EVENT",
            Self::Hours24 => "HOURS_24",
        }
    }

    /// Whether a battery-powered node needs the network in this state.
    pub const fn needs_network(self) -> bool {
        self as u8 & NETWORK_STATES != 0
    }

    /// Whether the next power-off should be the short one.
    pub const fn is_event_processing(self) -> bool {
        self as u8 & SHORT_SLEEP_STATES != 0
    }
}

impl TryFrom<u8> for State {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(Self::Startup),
            2 => Ok(Self::WaitForEvent),
            4 => Ok(Self::ProcessEvent),
            8 => Ok(Self::WaitEndEvent),
            16 => Ok(Self::EndEvent),
            32 => Ok(Self::Hours24),
            other => Err(other),
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the application's decision function reports for the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserResult {
    /// Processing for this state is done.
    Completed,
    /// Run this state again on the next activation.
    NotCompleted,
    /// In `ProcessEvent`: the event vanished, go back to waiting.
    Aborted,
    /// In `WaitForEvent`: an event must be processed.
    NewEvent,
    /// In `WaitEndEvent`: process the event once more.
    Retry,
}

/// Outcome of one transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: State,
    pub return_state: State,
}

/// Apply the decision `result` to `state`.
///
/// `hour_tick` is consulted only where the table says "check 24h"; it is
/// called at most once and returns true when the 24 hour accumulator
/// overflowed, which diverts to [`State::Hours24`] while remembering the
/// interrupted state in `return_state`.
pub fn transition(
    state: State,
    return_state: State,
    result: UserResult,
    hour_tick: impl FnOnce() -> bool,
) -> Transition {
    let settle = |next: State| Transition {
        state: next,
        return_state: next,
    };

    match (state, result) {
        (State::Startup, UserResult::NotCompleted) => Transition {
            state,
            return_state,
        },
        (State::Startup, _) => settle(State::WaitForEvent),

        (State::WaitForEvent, UserResult::NewEvent) => settle(State::ProcessEvent),
        (State::WaitForEvent, _) => stay(State::WaitForEvent, hour_tick),

        (State::ProcessEvent, UserResult::Aborted) => settle(State::WaitForEvent),
        (State::ProcessEvent, UserResult::NotCompleted) => stay(State::ProcessEvent, hour_tick),
        (State::ProcessEvent, _) => settle(State::WaitEndEvent),

        (State::WaitEndEvent, UserResult::Retry) => settle(State::ProcessEvent),
        (State::WaitEndEvent, UserResult::NotCompleted) => stay(State::WaitEndEvent, hour_tick),
        (State::WaitEndEvent, _) => settle(State::EndEvent),

        (State::EndEvent, UserResult::NotCompleted) => Transition {
            state,
            return_state,
        },
        (State::EndEvent, _) => settle(State::WaitForEvent),

        (State::Hours24, _) => settle(return_state),
    }
}

/// Remain in `current` unless the hour accumulator overflows.
fn stay(current: State, hour_tick: impl FnOnce() -> bool) -> Transition {
    Transition {
        state: if hour_tick() { State::Hours24 } else { current },
        return_state: current,
    }
}

/// Fold the time spent since the last check into the hour accumulator.
///
/// Returns true when 24 full hours have been counted; both counters are then
/// back at zero.
pub fn check_24_hours(mem: &mut PersistentState, one_hour_ms: u32) -> bool {
    if mem.one_hour_step_count >= one_hour_ms {
        mem.one_hour_step_count = 0;
        mem.hours_24_count += 1;
        if mem.hours_24_count >= 24 {
            mem.hours_24_count = 0;
            return true;
        }
    }
    false
}
