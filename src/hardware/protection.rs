//! Debounced over-voltage, over-current and over-power protection.

use enum_iterator::Sequence;
use serde::{Deserialize, Serialize};

use super::{Duration, Instant};

/// Represents the protections present on every channel.
#[derive(Sequence, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectionKind {
    OverVoltage,
    OverCurrent,
    OverPower,
}

/// Where the over-voltage protection is enforced.
#[derive(Sequence, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoltageProtectionType {
    Software,
    Hardware,
}

/// The observable state of a single protection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum ProtectionState {
    Normal,
    /// The trip condition holds and the delay is running.
    Armed,
    /// Latched until explicitly cleared.
    Tripped,
}

/// Runtime state of a single protection.
#[derive(Debug, Copy, Clone, Default)]
pub struct ProtectionValue {
    tripped: bool,
    alarm_started: Option<Instant>,
}

impl ProtectionValue {
    pub fn state(&self) -> ProtectionState {
        if self.tripped {
            ProtectionState::Tripped
        } else if self.alarm_started.is_some() {
            ProtectionState::Armed
        } else {
            ProtectionState::Normal
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    pub fn is_alarmed(&self) -> bool {
        self.alarm_started.is_some()
    }

    /// Evaluate the protection once.
    ///
    /// # Args
    /// * `active` - Whether the protection is enabled and the channel output is on.
    /// * `condition` - Whether the trip condition currently holds.
    /// * `delay` - How long the condition must hold before the protection trips.
    /// * `now` - The current time.
    ///
    /// # Returns
    /// True if the protection tripped during this evaluation.
    pub fn check(&mut self, active: bool, condition: bool, delay: Duration, now: Instant) -> bool {
        if self.tripped {
            return false;
        }

        if !(active && condition) {
            self.alarm_started = None;
            return false;
        }

        if delay.ticks() == 0 {
            self.trip();
            return true;
        }

        match self.alarm_started {
            Some(started) => {
                let elapsed = now
                    .checked_duration_since(started)
                    .unwrap_or(Duration::from_ticks(0));
                if elapsed >= delay {
                    self.trip();
                    true
                } else {
                    false
                }
            }
            None => {
                self.alarm_started.replace(now);
                false
            }
        }
    }

    fn trip(&mut self) {
        self.alarm_started = None;
        self.tripped = true;
    }

    /// Return to the normal state.
    pub fn clear(&mut self) {
        self.alarm_started = None;
        self.tripped = false;
    }
}

/// Convert a delay in seconds into a duration, saturating negative delays to zero.
pub fn delay_from_secs(seconds: f32) -> Duration {
    if seconds > 0.0 {
        Duration::micros(libm::roundf(seconds * 1_000_000.0) as u64)
    } else {
        Duration::from_ticks(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_ms(ms: u64) -> Instant {
        Instant::from_ticks(ms * 1000)
    }

    #[test]
    fn trips_after_delay() {
        let mut protection = ProtectionValue::default();
        let delay = delay_from_secs(0.5);

        assert!(!protection.check(true, true, delay, at_ms(100)));
        assert_eq!(protection.state(), ProtectionState::Armed);

        assert!(!protection.check(true, true, delay, at_ms(599)));
        assert_eq!(protection.state(), ProtectionState::Armed);

        assert!(protection.check(true, true, delay, at_ms(600)));
        assert_eq!(protection.state(), ProtectionState::Tripped);

        // Latched until cleared.
        assert!(!protection.check(true, false, delay, at_ms(700)));
        assert!(protection.is_tripped());
        protection.clear();
        assert_eq!(protection.state(), ProtectionState::Normal);
    }

    #[test]
    fn condition_loss_resets_alarm() {
        let mut protection = ProtectionValue::default();
        let delay = delay_from_secs(0.5);

        protection.check(true, true, delay, at_ms(0));
        assert!(protection.is_alarmed());

        protection.check(true, false, delay, at_ms(300));
        assert_eq!(protection.state(), ProtectionState::Normal);

        // The delay restarts from the new detection.
        assert!(!protection.check(true, true, delay, at_ms(400)));
        assert!(!protection.check(true, true, delay, at_ms(800)));
        assert!(protection.check(true, true, delay, at_ms(900)));
    }

    #[test]
    fn zero_delay_trips_immediately() {
        let mut protection = ProtectionValue::default();
        assert!(protection.check(true, true, delay_from_secs(0.0), at_ms(5)));
        assert!(protection.is_tripped());
    }

    #[test]
    fn inactive_never_trips() {
        let mut protection = ProtectionValue::default();
        for ms in 0..10 {
            assert!(!protection.check(false, true, delay_from_secs(0.0), at_ms(ms)));
        }
        assert_eq!(protection.state(), ProtectionState::Normal);
    }
}
