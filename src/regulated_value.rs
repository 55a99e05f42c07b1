//! Commanded and monitored state of one regulated quantity.

use crate::filter::MeasurementFilter;

/// A regulated quantity (voltage or current) of a channel.
///
/// # Note
/// Setters maintain `min <= set <= limit <= max` at all times.
#[derive(Debug, Copy, Clone)]
pub struct RegulatedValue {
    set: f32,
    limit: f32,
    min: f32,
    max: f32,
    default: f32,

    /// Filtered ADC measurement of the output.
    pub monitor: MeasurementFilter,

    /// Filtered read-back of the programmed DAC value.
    pub dac_readback: MeasurementFilter,
}

impl RegulatedValue {
    /// Construct a regulated value.
    ///
    /// # Args
    /// * `min` - The smallest value the hardware can be programmed to.
    /// * `default` - The value applied on reset.
    /// * `max` - The largest value the hardware can be programmed to.
    pub fn new(min: f32, default: f32, max: f32) -> Self {
        let mut value = Self {
            set: min,
            limit: max,
            min,
            max,
            default,
            monitor: MeasurementFilter::new(),
            dac_readback: MeasurementFilter::new(),
        };
        value.reset();
        value
    }

    /// Restore the default setpoint and open the limit up to the maximum.
    pub fn reset(&mut self) {
        self.limit = self.max;
        self.set = self.default.clamp(self.min, self.limit);
        self.reset_monitor();
    }

    /// Forget all measured history.
    pub fn reset_monitor(&mut self) {
        self.monitor.reset();
        self.dac_readback.reset();
    }

    pub fn set(&self) -> f32 {
        self.set
    }

    pub fn limit(&self) -> f32 {
        self.limit
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    pub fn default_value(&self) -> f32 {
        self.default
    }

    /// Update the setpoint.
    ///
    /// # Note
    /// Non-finite values are ignored.
    ///
    /// # Returns
    /// The setpoint after clamping into `[min, limit]`.
    pub fn set_value(&mut self, value: f32) -> f32 {
        if value.is_finite() {
            self.set = value.clamp(self.min, self.limit);
        }
        self.set
    }

    /// Update the limit.
    ///
    /// # Note
    /// The setpoint is pulled down if it exceeds the new limit. Non-finite requests are ignored.
    ///
    /// # Args
    /// * `limit` - The requested limit.
    /// * `ceiling` - The largest acceptable limit, at most `max`.
    ///
    /// # Returns
    /// True if the setpoint had to be reduced.
    pub fn set_limit(&mut self, limit: f32, ceiling: f32) -> bool {
        if !limit.is_finite() || !ceiling.is_finite() {
            return false;
        }

        let ceiling = ceiling.clamp(self.min, self.max);
        self.limit = limit.clamp(self.min, ceiling);

        if self.set > self.limit {
            self.set = self.limit;
            true
        } else {
            false
        }
    }

    /// Check the ordering invariant.
    pub fn is_consistent(&self) -> bool {
        self.min <= self.set && self.set <= self.limit && self.limit <= self.max
    }
}
