// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use log::{debug, info};

use crate::config::StatusConfig;

/// The roof-control decision. `RoofOpen` and `RoofClosed` are confirmed
/// states; the pending states mean the sky disagrees with the roof but not
/// yet for long enough to act on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ObservatoryState {
    #[default]
    RoofOpen,
    RoofClosed,
    // Roof is closed, clear readings are accumulating.
    OpenPending,
    // Roof is open, cloudy readings are accumulating.
    ClosePending,
}

impl ObservatoryState {
    /// Human-readable status string for this state, as configured.
    pub fn status_message<'a>(&self, messages: &'a StatusConfig) -> &'a str {
        match self {
            ObservatoryState::RoofOpen => &messages.clear_message,
            ObservatoryState::RoofClosed => &messages.cloud_message,
            ObservatoryState::OpenPending => &messages.clear_pending_message,
            ObservatoryState::ClosePending => &messages.cloud_pending_message,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ObservatoryState::OpenPending | ObservatoryState::ClosePending)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HysteresisCounters {
    // Consecutive cloudy readings.
    pub cloud_count: u32,
    // Consecutive clear readings.
    pub clear_count: u32,
}

/// Hysteresis transition function. The counter matching the reading is
/// incremented and the other is zeroed. Reaching `pending_threshold`
/// confirms the corresponding roof state and zeroes its counter. A contrary
/// reading during a pending window returns to the confirmed state the
/// window departed from.
pub fn update(current_state: ObservatoryState,
              counters: HysteresisCounters,
              is_cloudy: bool,
              pending_threshold: u32)
              -> (ObservatoryState, HysteresisCounters) {
    use ObservatoryState::*;
    let mut counters = counters;
    if is_cloudy {
        counters.cloud_count += 1;
        counters.clear_count = 0;
    } else {
        counters.clear_count += 1;
        counters.cloud_count = 0;
    }
    let cloud_confirmed = counters.cloud_count >= pending_threshold;
    let clear_confirmed = counters.clear_count >= pending_threshold;
    let new_state = match (current_state, is_cloudy) {
        // Confirmed states absorb agreeing readings; the counter just accrues.
        (RoofClosed, true) => RoofClosed,
        (RoofOpen, false) => RoofOpen,

        (RoofOpen | ClosePending | OpenPending, true) if cloud_confirmed => {
            counters.cloud_count = 0;
            RoofClosed
        },
        (RoofOpen | ClosePending, true) => ClosePending,
        // Reopening abandoned; the roof never opened.
        (OpenPending, true) => RoofClosed,

        (RoofClosed | OpenPending | ClosePending, false) if clear_confirmed => {
            counters.clear_count = 0;
            RoofOpen
        },
        (RoofClosed | OpenPending, false) => OpenPending,
        // Closing abandoned; the roof never closed.
        (ClosePending, false) => RoofOpen,
    };
    (new_state, counters)
}

/// Owns the current ObservatoryState. State is in-memory only; a restart
/// begins again at `RoofOpen`.
pub struct StateTracker {
    state: ObservatoryState,
    counters: HysteresisCounters,
    pending_threshold: u32,
}

impl StateTracker {
    pub fn new(pending_threshold: u32) -> Self {
        StateTracker{state: ObservatoryState::default(),
                     counters: HysteresisCounters::default(),
                     pending_threshold}
    }

    pub fn state(&self) -> ObservatoryState {
        self.state
    }

    pub fn counters(&self) -> HysteresisCounters {
        self.counters
    }

    /// Folds one classification into the tracker and returns the resulting
    /// state.
    pub fn observe(&mut self, is_cloudy: bool) -> ObservatoryState {
        let (new_state, new_counters) =
            update(self.state, self.counters, is_cloudy, self.pending_threshold);
        if new_state != self.state {
            info!("Observatory state {:?} -> {:?}", self.state, new_state);
        }
        debug!("Hysteresis counters: cloudy {} clear {} (threshold {})",
               new_counters.cloud_count, new_counters.clear_count,
               self.pending_threshold);
        self.state = new_state;
        self.counters = new_counters;
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ObservatoryState::*;

    const T: bool = true;
    const F: bool = false;

    fn run(readings: &[bool], threshold: u32) -> Vec<ObservatoryState> {
        let mut tracker = StateTracker::new(threshold);
        readings.iter().map(|r| tracker.observe(*r)).collect()
    }

    #[test]
    fn test_initial_state() {
        let tracker = StateTracker::new(3);
        assert_eq!(tracker.state(), RoofOpen);
        assert_eq!(tracker.counters(), HysteresisCounters::default());
    }

    #[test]
    fn test_three_cloudy_closes() {
        assert_eq!(run(&[T, T, T], 3), vec![ClosePending, ClosePending, RoofClosed]);
    }

    #[test]
    fn test_clear_reading_resets_close_pending() {
        let mut tracker = StateTracker::new(3);
        tracker.observe(T);
        tracker.observe(T);
        assert_eq!(tracker.counters().cloud_count, 2);

        assert_eq!(tracker.observe(F), RoofOpen);
        assert_eq!(tracker.counters(), HysteresisCounters{cloud_count: 0, clear_count: 1});

        assert_eq!(tracker.observe(T), ClosePending);
        assert_eq!(tracker.observe(T), ClosePending);
        assert_eq!(tracker.observe(T), RoofClosed);
    }

    #[test]
    fn test_reopen_after_close() {
        let states = run(&[T, T, T, F, F, F], 3);
        assert_eq!(states, vec![ClosePending, ClosePending, RoofClosed,
                                OpenPending, OpenPending, RoofOpen]);
    }

    #[test]
    fn test_cloudy_reading_resets_open_pending() {
        let states = run(&[T, T, T, F, F, T, F, F, F], 3);
        assert_eq!(states, vec![ClosePending, ClosePending, RoofClosed,
                                OpenPending, OpenPending, RoofClosed,
                                OpenPending, OpenPending, RoofOpen]);
    }

    #[test]
    fn test_confirmed_state_absorbs_single_misread() {
        // Open roof, one cloudy frame among clear ones.
        let states = run(&[F, F, T, F, F], 3);
        assert!(!states.contains(&RoofClosed));
        assert_eq!(*states.last().unwrap(), RoofOpen);

        // Closed roof, one clear frame among cloudy ones.
        let states = run(&[T, T, T, F, T, T], 3);
        assert_eq!(*states.last().unwrap(), RoofClosed);
        assert!(!states.contains(&RoofOpen));
    }

    #[test]
    fn test_closed_stays_closed_while_cloudy() {
        let states = run(&[T; 10], 3);
        assert!(states[2..].iter().all(|s| *s == RoofClosed));
    }

    #[test]
    fn test_threshold_one_has_no_pending() {
        assert_eq!(run(&[T, F, T], 1), vec![RoofClosed, RoofOpen, RoofClosed]);
        assert_eq!(run(&[T, F], 0), vec![RoofClosed, RoofOpen]);
    }

    #[test]
    fn test_status_messages() {
        let messages = StatusConfig::default();
        assert_eq!(RoofOpen.status_message(&messages), "Roof Open");
        assert_eq!(RoofClosed.status_message(&messages), "Roof Closed");
        assert_eq!(OpenPending.status_message(&messages), "Open Pending");
        assert_eq!(ClosePending.status_message(&messages), "Close Pending");
    }

    // Exhaustively checks all reading sequences up to length 10: the roof
    // only closes after `threshold` consecutive cloudy readings (and only
    // opens after `threshold` consecutive clear readings), and pending states
    // always carry a counter in 1..threshold.
    #[test]
    fn test_hysteresis_properties() {
        let threshold = 3;
        for len in 1..=10_u32 {
            for bits in 0..(1_u32 << len) {
                let mut state = RoofOpen;
                let mut counters = HysteresisCounters::default();
                let mut cloudy_run = 0;
                let mut clear_run = 0;
                for i in 0..len {
                    let is_cloudy = bits & (1 << i) != 0;
                    if is_cloudy {
                        cloudy_run += 1;
                        clear_run = 0;
                    } else {
                        clear_run += 1;
                        cloudy_run = 0;
                    }
                    let (new_state, new_counters) =
                        update(state, counters, is_cloudy, threshold);
                    let was_closed = matches!(state, RoofClosed | OpenPending);
                    if new_state == RoofClosed && !was_closed {
                        assert!(cloudy_run >= threshold);
                    }
                    if new_state == RoofOpen && was_closed {
                        assert!(clear_run >= threshold);
                    }
                    // Pending windows are always partway to the threshold.
                    if new_state.is_pending() {
                        let count = if new_state == ClosePending {
                            new_counters.cloud_count
                        } else {
                            new_counters.clear_count
                        };
                        assert!((1..threshold).contains(&count));
                    } else {
                        assert!(matches!(new_state, RoofOpen | RoofClosed));
                    }
                    state = new_state;
                    counters = new_counters;
                }
            }
        }
    }

}  // mod tests.
