use log::debug;

use crate::circuit::SwitchInfo;
use crate::error::Result;

/// Switch states over simulated time.
///
/// Each switch flips once for every toggle instant the clock crosses. An
/// interval `(previous, current]` is half-open: an event sitting exactly on
/// `previous` has already been applied (or predates the run) and does not
/// fire again.
#[derive(Debug, Clone)]
pub struct SwitchScheduler {
    initial: Vec<bool>,
    events: Vec<Vec<f64>>,
    states: Vec<bool>,
    dirty: bool,
    toggles: usize,
}

impl SwitchScheduler {
    pub fn new(switches: &[SwitchInfo]) -> Self {
        let initial: Vec<bool> = switches.iter().map(|s| s.initial_state).collect();
        SwitchScheduler {
            states: initial.clone(),
            initial,
            events: switches.iter().map(|s| s.events.clone()).collect(),
            dirty: false,
            toggles: 0,
        }
    }

    /// Back to the initial states, nothing pending
    pub fn reset(&mut self) {
        self.states.copy_from_slice(&self.initial);
        self.dirty = false;
        self.toggles = 0;
    }

    pub fn states(&self) -> &[bool] {
        &self.states
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Total toggles applied since the last reset
    pub fn toggle_count(&self) -> usize {
        self.toggles
    }

    /// Apply every toggle in `(previous, current]`. Returns how many fired.
    pub fn advance(&mut self, previous: f64, current: f64) -> usize {
        let mut fired = 0;
        for (switch, events) in self.events.iter().enumerate() {
            let count = events
                .iter()
                .filter(|&&t| previous < t && t <= current)
                .count();
            if count % 2 == 1 {
                self.states[switch] = !self.states[switch];
            }
            if count > 0 {
                debug!(
                    "Switch {} toggled {} time(s) in ({}, {}], now {}",
                    switch, count, previous, current, self.states[switch]
                );
            }
            fired += count;
        }

        if fired > 0 {
            self.dirty = true;
            self.toggles += fired;
        }
        fired
    }

    /// Earliest toggle instant strictly after `t`
    pub fn next_event_after(&self, t: f64) -> Option<f64> {
        self.events
            .iter()
            .filter_map(|events| events.iter().copied().find(|&e| e > t))
            .min_by(|a, b| a.total_cmp(b))
    }

    /// Run `rebuild` with the current states if a toggle happened since the
    /// last rebuild. The flag clears only when the rebuild succeeds.
    pub fn rebuild_if_dirty<T, F>(&mut self, rebuild: F) -> Result<Option<T>>
    where
        F: FnOnce(&[bool]) -> Result<T>,
    {
        if !self.dirty {
            return Ok(None);
        }
        let rebuilt = rebuild(&self.states)?;
        self.dirty = false;
        Ok(Some(rebuilt))
    }
}
