//! Measurement filtering for monitored and DAC read-back values.
//!
//! # Note
//! Raw samples are averaged over a fixed window. The externally visible value only follows
//! the average once it has moved by at least one resolution step, which keeps displayed and
//! reported values from flickering on the least significant digit.

/// The number of samples averaged by the measurement filter.
pub const NUM_AVERAGING_VALUES: usize = 10;

/// Round a value to the nearest multiple of a precision step.
///
/// # Args
/// * `value` - The value to round.
/// * `precision` - The step size. Non-positive steps leave the value untouched.
pub fn round_prec(value: f32, precision: f32) -> f32 {
    if precision <= 0.0 {
        return value;
    }

    if precision >= 1.0 {
        return libm::roundf(value / precision) * precision;
    }

    // Decimal steps have integral reciprocals, which are exact.
    let factor = libm::roundf(1.0 / precision);
    libm::roundf(value * factor) / factor
}

/// A fixed-window moving average.
#[derive(Debug, Copy, Clone)]
pub struct MovingAverage {
    samples: [f32; NUM_AVERAGING_VALUES],
    index: usize,
    sum: f32,
    primed: bool,
}

impl Default for MovingAverage {
    fn default() -> Self {
        Self::new()
    }
}

impl MovingAverage {
    pub const fn new() -> Self {
        Self {
            samples: [0.0; NUM_AVERAGING_VALUES],
            index: 0,
            sum: 0.0,
            primed: false,
        }
    }

    /// Discard the averaging history.
    pub fn reset(&mut self) {
        self.primed = false;
    }

    /// Add a sample to the window.
    ///
    /// # Note
    /// The first sample after a reset fills the whole window, so there is no warm-up transient.
    ///
    /// # Returns
    /// The average over the window after the sample was added.
    pub fn push(&mut self, sample: f32) -> f32 {
        if !self.primed {
            self.samples = [sample; NUM_AVERAGING_VALUES];
            self.index = 0;
            self.primed = true;
        } else {
            self.samples[self.index] = sample;
            self.index = (self.index + 1) % NUM_AVERAGING_VALUES;
        }

        // The sum is rebuilt from the window to avoid accumulating rounding error.
        self.sum = self.samples.iter().sum();
        self.sum / NUM_AVERAGING_VALUES as f32
    }
}

/// Averaging filter with resolution hysteresis.
#[derive(Debug, Copy, Clone, Default)]
pub struct MeasurementFilter {
    average: MovingAverage,
    value: f32,
    previous: f32,
    last: f32,
    measured: bool,
}

impl MeasurementFilter {
    pub const fn new() -> Self {
        Self {
            average: MovingAverage::new(),
            value: 0.0,
            previous: 0.0,
            last: 0.0,
            measured: false,
        }
    }

    /// Feed a new sample into the filter.
    ///
    /// # Args
    /// * `sample` - The sample, in engineering units.
    /// * `resolution` - The resolution of the quantity. This is both the rounding step and the
    ///   hysteresis band of the visible value.
    pub fn add_sample(&mut self, sample: f32, resolution: f32) {
        self.last = round_prec(sample, resolution);
        let candidate = self.average.push(sample);

        if !self.measured {
            self.value = self.last;
            self.previous = self.last;
            self.measured = true;
        } else if libm::fabsf(self.previous - candidate) >= resolution {
            self.value = round_prec(candidate, resolution);
            self.previous = candidate;
        }
    }

    /// Pin the filter output to zero, e.g. while outputs are inhibited.
    pub fn hold_zero(&mut self) {
        self.average.reset();
        self.value = 0.0;
        self.previous = 0.0;
        self.last = 0.0;
        self.measured = true;
    }

    /// Forget all history. The next sample is taken as-is.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// The filtered, hysteresis-limited value.
    pub fn value(&self) -> f32 {
        self.value
    }

    /// The most recent sample, rounded to resolution.
    pub fn last(&self) -> f32 {
        self.last
    }

    /// Whether at least one sample has been received since the last reset.
    pub fn is_measured(&self) -> bool {
        self.measured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(round_prec(1.234, 0.01), 1.23);
        assert_eq!(round_prec(1.235_1, 0.01), 1.24);
        assert_eq!(round_prec(-0.004, 0.01), 0.0);
        assert_eq!(round_prec(7.5, 0.0), 7.5);
        assert_eq!(round_prec(1.0, 0.0005), 1.0);
        assert_eq!(round_prec(2.5, 0.0005), 2.5);
        assert_eq!(round_prec(7.0, 2.0), 8.0);
    }

    #[test]
    fn identical_samples_do_not_drift() {
        let mut filter = MeasurementFilter::new();
        for _ in 0..NUM_AVERAGING_VALUES {
            filter.add_sample(5.0, 0.01);
            assert_eq!(filter.value(), 5.0);
        }

        for _ in 0..100 {
            filter.add_sample(5.0, 0.01);
        }
        assert_eq!(filter.value(), 5.0);
        assert_eq!(filter.last(), 5.0);
    }

    #[test]
    fn first_sample_fills_window() {
        let mut filter = MeasurementFilter::new();
        assert!(!filter.is_measured());
        filter.add_sample(12.0, 0.01);
        assert!(filter.is_measured());
        assert_eq!(filter.value(), 12.0);

        // One differing sample moves the average by a tenth of the difference.
        filter.add_sample(13.0, 0.01);
        assert_eq!(filter.value(), 12.1);
    }

    #[test]
    fn small_changes_are_suppressed() {
        let mut filter = MeasurementFilter::new();
        filter.add_sample(1.0, 0.25);

        // Each differing sample only moves the average by a tenth of the step.
        filter.add_sample(2.0, 0.25);
        assert_eq!(filter.value(), 1.0);
        assert_eq!(filter.last(), 2.0);

        filter.add_sample(2.0, 0.25);
        assert_eq!(filter.value(), 1.0);

        // Once the average has drifted by a full step, the visible value follows.
        filter.add_sample(2.0, 0.25);
        assert_eq!(filter.value(), 1.25);
    }

    #[test]
    fn hold_zero_then_resume() {
        let mut filter = MeasurementFilter::new();
        filter.add_sample(3.0, 0.01);
        filter.hold_zero();
        assert_eq!(filter.value(), 0.0);
        assert_eq!(filter.last(), 0.0);

        filter.add_sample(3.0, 0.01);
        assert_eq!(filter.last(), 3.0);
        assert_eq!(filter.value(), 3.0);
    }
}
