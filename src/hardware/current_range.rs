//! Current range selection for dual-range channel modules.
//!
//! # Note
//! Range changes requested by setpoints apply immediately while the output is off. While the
//! output is on, consecutive physical changes are spaced by at least the board's switching delay;
//! a change requested too early is held back and applied once the delay has passed, unless a
//! later request cancels it.

use enum_iterator::Sequence;
use serde::{Deserialize, Serialize};

use super::{Duration, Instant};

/// The active current measurement and control path.
#[derive(Sequence, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CurrentRange {
    High,
    Low,
}

/// The user policy for selecting a current range.
#[derive(Sequence, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CurrentRangeSelectionMode {
    /// Select automatically based on the set and measured current.
    UseBoth,
    AlwaysHigh,
    AlwaysLow,
}

impl CurrentRangeSelectionMode {
    /// Get the range required for a current setpoint.
    ///
    /// # Args
    /// * `current` - The current setpoint.
    /// * `crossover` - Setpoints above this value require the high range.
    pub fn range_for(&self, current: f32, crossover: f32) -> CurrentRange {
        match self {
            CurrentRangeSelectionMode::UseBoth if current > crossover => CurrentRange::High,
            CurrentRangeSelectionMode::UseBoth => CurrentRange::Low,
            CurrentRangeSelectionMode::AlwaysHigh => CurrentRange::High,
            CurrentRangeSelectionMode::AlwaysLow => CurrentRange::Low,
        }
    }
}

/// Inputs to the automatic range hysteresis.
#[derive(Debug, Copy, Clone)]
pub struct AutoRangeInputs {
    pub output_enabled: bool,
    /// Automatic switching is enabled, the policy is `UseBoth` and the channel is not being
    /// calibrated or tested.
    pub allowed: bool,
    pub current_set: f32,
    pub current_measured: Option<f32>,
    pub cc_mode: bool,
    pub crossover: f32,
}

/// Work the channel must carry out after polling the range controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RangeAction {
    /// Switch to the given range and re-program the current setpoint for it.
    Select(CurrentRange),

    /// Switch to the low range and pre-load the full-scale current code.
    SwitchToLow,

    /// Push the current setpoint through the forward path again.
    ReapplySetpoint,
}

/// Tracks the active current range and enforces the switching delay.
#[derive(Debug, Copy, Clone)]
pub struct CurrentRangeController {
    range: CurrentRange,
    last_change: Option<Instant>,
    deferred: Option<CurrentRange>,
}

impl Default for CurrentRangeController {
    fn default() -> Self {
        Self::new()
    }
}

impl CurrentRangeController {
    pub const fn new() -> Self {
        Self {
            range: CurrentRange::High,
            last_change: None,
            deferred: None,
        }
    }

    pub fn range(&self) -> CurrentRange {
        self.range
    }

    /// Forget timing state and return to the high range.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn delay_elapsed(&self, now: Instant, delay: Duration) -> bool {
        match self.last_change {
            Some(last) => now
                .checked_duration_since(last)
                .map_or(false, |elapsed| elapsed >= delay),
            None => true,
        }
    }

    fn apply(&mut self, range: CurrentRange, now: Instant, output_enabled: bool) {
        self.range = range;
        self.deferred = None;
        self.last_change = output_enabled.then_some(now);
    }

    /// Request a range for a new current setpoint.
    ///
    /// # Args
    /// * `desired` - The range the setpoint requires.
    /// * `now` - The current time.
    /// * `output_enabled` - Whether the channel output is on.
    /// * `delay` - The minimum spacing of range changes while output is on.
    ///
    /// # Returns
    /// The range to program into the hardware if a physical change must happen now.
    pub fn select(
        &mut self,
        desired: CurrentRange,
        now: Instant,
        output_enabled: bool,
        delay: Duration,
    ) -> Option<CurrentRange> {
        if desired == self.range {
            self.deferred = None;
            return None;
        }

        if output_enabled && !self.delay_elapsed(now, delay) {
            self.deferred.replace(desired);
            return None;
        }

        self.apply(desired, now, output_enabled);
        Some(desired)
    }

    /// Periodic service of the range controller.
    ///
    /// # Returns
    /// The action the channel has to take, if any.
    pub fn poll(
        &mut self,
        now: Instant,
        inputs: &AutoRangeInputs,
        delay: Duration,
    ) -> Option<RangeAction> {
        if !inputs.output_enabled {
            self.last_change = None;
            return self.deferred.take().map(|range| {
                self.range = range;
                RangeAction::Select(range)
            });
        }

        // Arm the switching delay when the output has just turned on.
        if self.last_change.is_none() {
            self.last_change.replace(now);
            return None;
        }

        if !self.delay_elapsed(now, delay) {
            return None;
        }

        if let Some(range) = self.deferred.take() {
            self.apply(range, now, true);
            return Some(RangeAction::Select(range));
        }

        if !inputs.allowed {
            return None;
        }

        match self.range {
            CurrentRange::Low if inputs.current_set > inputs.crossover && inputs.cc_mode => {
                Some(RangeAction::ReapplySetpoint)
            }
            CurrentRange::High => match inputs.current_measured {
                Some(current) if current < inputs.crossover => {
                    self.apply(CurrentRange::Low, now, true);
                    Some(RangeAction::SwitchToLow)
                }
                _ => None,
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::millis(5);

    fn at_ms(ms: u64) -> Instant {
        Instant::from_ticks(ms * 1000)
    }

    fn inputs(output_enabled: bool) -> AutoRangeInputs {
        AutoRangeInputs {
            output_enabled,
            allowed: true,
            current_set: 1.0,
            current_measured: None,
            cc_mode: false,
            crossover: 0.05,
        }
    }

    #[test]
    fn policy() {
        let mode = CurrentRangeSelectionMode::UseBoth;
        assert_eq!(mode.range_for(0.05, 0.05), CurrentRange::Low);
        assert_eq!(mode.range_for(0.051, 0.05), CurrentRange::High);
        assert_eq!(
            CurrentRangeSelectionMode::AlwaysLow.range_for(3.0, 0.05),
            CurrentRange::Low
        );
        assert_eq!(
            CurrentRangeSelectionMode::AlwaysHigh.range_for(0.0, 0.05),
            CurrentRange::High
        );
    }

    #[test]
    fn immediate_while_output_off() {
        let mut controller = CurrentRangeController::new();
        assert_eq!(
            controller.select(CurrentRange::Low, at_ms(0), false, DELAY),
            Some(CurrentRange::Low)
        );
        assert_eq!(
            controller.select(CurrentRange::High, at_ms(1), false, DELAY),
            Some(CurrentRange::High)
        );
    }

    #[test]
    fn two_crossings_within_delay_change_once() {
        let mut controller = CurrentRangeController::new();
        controller.poll(at_ms(0), &inputs(true), DELAY);

        let mut changes = 0;
        if controller.select(CurrentRange::Low, at_ms(6), true, DELAY).is_some() {
            changes += 1;
        }
        if controller.select(CurrentRange::High, at_ms(7), true, DELAY).is_some() {
            changes += 1;
        }
        assert_eq!(changes, 1);
        assert_eq!(controller.range(), CurrentRange::Low);

        // The second request is applied once the delay has passed.
        assert_eq!(controller.poll(at_ms(9), &inputs(true), DELAY), None);
        assert_eq!(
            controller.poll(at_ms(11), &inputs(true), DELAY),
            Some(RangeAction::Select(CurrentRange::High))
        );
    }

    #[test]
    fn crossing_back_cancels_deferred_change() {
        let mut controller = CurrentRangeController::new();
        controller.poll(at_ms(0), &inputs(true), DELAY);

        assert_eq!(controller.select(CurrentRange::Low, at_ms(1), true, DELAY), None);
        assert_eq!(controller.select(CurrentRange::High, at_ms(2), true, DELAY), None);
        assert_eq!(controller.poll(at_ms(10), &inputs(true), DELAY), None);
        assert_eq!(controller.range(), CurrentRange::High);
    }

    #[test]
    fn switches_down_on_low_measurement() {
        let mut controller = CurrentRangeController::new();
        let mut low = inputs(true);
        low.current_measured = Some(0.01);

        // Armed on the first enabled poll.
        assert_eq!(controller.poll(at_ms(0), &low, DELAY), None);
        assert_eq!(controller.poll(at_ms(3), &low, DELAY), None);
        assert_eq!(
            controller.poll(at_ms(5), &low, DELAY),
            Some(RangeAction::SwitchToLow)
        );
        assert_eq!(controller.range(), CurrentRange::Low);

        // In the low range with a high setpoint in CC mode, the setpoint is pushed again.
        low.cc_mode = true;
        assert_eq!(controller.poll(at_ms(6), &low, DELAY), None);
        assert_eq!(
            controller.poll(at_ms(10), &low, DELAY),
            Some(RangeAction::ReapplySetpoint)
        );
    }

    #[test]
    fn output_off_resets_timer() {
        let mut controller = CurrentRangeController::new();
        let mut low = inputs(true);
        low.current_measured = Some(0.01);
        low.allowed = false;
        controller.poll(at_ms(0), &low, DELAY);

        assert_eq!(controller.poll(at_ms(1), &inputs(false), DELAY), None);
        assert_eq!(
            controller.select(CurrentRange::Low, at_ms(2), false, DELAY),
            Some(CurrentRange::Low)
        );
    }
}
