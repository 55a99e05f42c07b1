//! Per-channel calibration transform between engineering units and converter codes.
//!
//! # Note
//! Each calibrated quantity (voltage, high-range current, low-range current) carries a list of
//! calibration points. A point ties a commanded DAC code, the value measured on the output with
//! an external reference, and the code the channel's own ADC reported. Setpoints are mapped
//! value-to-DAC, measurements are mapped ADC-to-value, both piecewise linearly.
//!
//! When a quantity has no calibration (or calibration is disabled), the nominal hardware scaling
//! is used instead.

use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::{
    hardware::{current_range::CurrentRange, BoardParameters},
    linear_transformation::LinearTransformation,
    Error,
};

/// The maximum number of calibration points stored per quantity.
pub const MAX_CALIBRATION_POINTS: usize = 10;

/// A single calibration point.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
pub struct CalibrationPoint {
    /// The DAC code that was commanded.
    pub dac: f32,
    /// The engineering value measured on the output.
    pub value: f32,
    /// The ADC code reported by the channel.
    pub adc: f32,
}

impl CalibrationPoint {
    pub const fn new(dac: f32, value: f32, adc: f32) -> Self {
        Self { dac, value, adc }
    }
}

/// The nominal (uncalibrated) relation between an engineering value and converter codes.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct HardwareScale {
    /// The engineering value corresponding to full-scale codes.
    pub full_scale: f32,
    /// The full-scale DAC code.
    pub dac_max: u16,
    /// The full-scale ADC code.
    pub adc_max: u16,
    /// Fixed correction added to values before they reach the converters.
    pub ground_offset: f32,
}

impl HardwareScale {
    fn dac_transform(&self) -> LinearTransformation {
        LinearTransformation::from_points((0.0, 0.0), (self.full_scale, self.dac_max as f32))
    }

    fn adc_transform(&self) -> LinearTransformation {
        LinearTransformation::from_points((0.0, 0.0), (self.full_scale, self.adc_max as f32))
    }

    /// Get the nominal DAC code for an engineering value.
    pub fn to_dac(&self, value: f32) -> f32 {
        self.dac_transform().map(value + self.ground_offset)
    }

    /// Get the nominal engineering value of an ADC code.
    pub fn from_adc(&self, code: f32) -> f32 {
        self.adc_transform().invert(code) - self.ground_offset
    }
}

/// Calibration data of one quantity.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct CalibrationValue {
    points: Vec<CalibrationPoint, MAX_CALIBRATION_POINTS>,
    min: f32,
    max: f32,
    calibrated: bool,
}

impl CalibrationValue {
    /// Construct calibration data from measured points.
    ///
    /// # Args
    /// * `points` - The calibration points, ordered by ascending value.
    ///
    /// # Returns
    /// The calibration data, or an error if there are too few or too many points or if the
    /// points are not ordered.
    pub fn from_points(points: &[CalibrationPoint]) -> Result<Self, Error> {
        if points.len() < 2 {
            return Err(Error::Invalid);
        }

        if points.windows(2).any(|pair| pair[1].value < pair[0].value) {
            return Err(Error::Invalid);
        }

        let points = Vec::from_slice(points).map_err(|_| Error::Bounds)?;
        let min = points[0].value;
        let max = points[points.len() - 1].value;

        Ok(Self {
            points,
            min,
            max,
            calibrated: true,
        })
    }

    /// A two-point calibration reproducing the nominal hardware scaling.
    ///
    /// # Note
    /// The identity is a starting point for calibration procedures and does not count as
    /// existing calibration data.
    pub fn identity(scale: &HardwareScale) -> Self {
        let low = CalibrationPoint::new(scale.to_dac(0.0), 0.0, 0.0);
        let high = CalibrationPoint::new(
            scale.to_dac(scale.full_scale),
            scale.full_scale,
            scale.adc_transform().map(scale.full_scale + scale.ground_offset),
        );

        let mut points = Vec::new();
        points.push(low).ok();
        points.push(high).ok();

        Self {
            points,
            min: 0.0,
            max: scale.full_scale,
            calibrated: false,
        }
    }

    /// Check if the quantity carries measured calibration data.
    pub fn exists(&self) -> bool {
        self.calibrated && self.points.len() >= 2
    }

    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    /// The minimum value achievable with this calibration.
    pub fn min(&self) -> f32 {
        self.min
    }

    /// The maximum value achievable with this calibration.
    pub fn max(&self) -> f32 {
        self.max
    }

    /// Select the segment used for an input.
    ///
    /// # Note
    /// Values beyond the outermost points extrapolate along the first or last segment.
    fn segment(
        &self,
        input: f32,
        key: impl Fn(&CalibrationPoint) -> f32,
        output: impl Fn(&CalibrationPoint) -> f32,
    ) -> LinearTransformation {
        let count = self.points.len();
        if count < 2 {
            return LinearTransformation::new(1.0, 0.0);
        }

        let mut upper = 1;
        while upper < count - 1 && input > key(&self.points[upper]) {
            upper += 1;
        }

        let (lower, upper) = (&self.points[upper - 1], &self.points[upper]);
        LinearTransformation::from_points((key(lower), output(lower)), (key(upper), output(upper)))
    }

    /// Map an engineering value to the DAC code that produces it.
    pub fn value_to_dac(&self, value: f32) -> f32 {
        self.segment(value, |p| p.value, |p| p.dac).map(value)
    }

    /// Map an ADC code to the engineering value it represents.
    pub fn adc_to_value(&self, code: f32) -> f32 {
        self.segment(code, |p| p.adc, |p| p.value).map(code)
    }
}

/// Calibration data of a channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct CalibrationConfiguration {
    pub voltage: CalibrationValue,
    pub current_high: CalibrationValue,
    pub current_low: CalibrationValue,
}

impl CalibrationConfiguration {
    /// Identity calibration of all quantities of a channel module.
    pub fn identity(params: &BoardParameters) -> Self {
        Self {
            voltage: CalibrationValue::identity(&params.voltage_scale()),
            current_high: CalibrationValue::identity(&params.current_scale(CurrentRange::High)),
            current_low: CalibrationValue::identity(&params.current_scale(CurrentRange::Low)),
        }
    }

    pub fn current(&self, range: CurrentRange) -> &CalibrationValue {
        match range {
            CurrentRange::High => &self.current_high,
            CurrentRange::Low => &self.current_low,
        }
    }

    pub fn current_mut(&mut self, range: CurrentRange) -> &mut CalibrationValue {
        match range {
            CurrentRange::High => &mut self.current_high,
            CurrentRange::Low => &mut self.current_low,
        }
    }

    /// Check if any quantity carries calibration data.
    pub fn any_exists(&self) -> bool {
        self.voltage.exists() || self.current_high.exists() || self.current_low.exists()
    }
}

/// Bidirectional conversion for one quantity.
pub struct CalibrationTransform<'a> {
    calibration: &'a CalibrationValue,
    scale: HardwareScale,
    enabled: bool,
}

impl<'a> CalibrationTransform<'a> {
    /// Construct a transform.
    ///
    /// # Args
    /// * `calibration` - The calibration data of the quantity.
    /// * `scale` - The nominal hardware scaling of the quantity.
    /// * `enabled` - Whether calibration is enabled on the channel.
    pub fn new(calibration: &'a CalibrationValue, scale: HardwareScale, enabled: bool) -> Self {
        Self {
            calibration,
            scale,
            enabled,
        }
    }

    fn calibrated(&self) -> bool {
        self.enabled && self.calibration.exists()
    }

    /// Convert an engineering value into a DAC code.
    ///
    /// # Note
    /// The code is clamped to the DAC range.
    pub fn to_raw(&self, value: f32) -> u16 {
        let code = if self.calibrated() {
            self.calibration.value_to_dac(value)
        } else {
            self.scale.to_dac(value)
        };

        libm::roundf(code.clamp(0.0, self.scale.dac_max as f32)) as u16
    }

    /// Convert an ADC code into an engineering value.
    pub fn to_engineering(&self, raw: u16) -> f32 {
        if self.calibrated() {
            self.calibration.adc_to_value(raw as f32)
        } else {
            self.scale.from_adc(raw as f32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCALE: HardwareScale = HardwareScale {
        full_scale: 40.0,
        dac_max: 65535,
        adc_max: 65535,
        ground_offset: 0.0,
    };

    fn two_point() -> CalibrationValue {
        CalibrationValue::from_points(&[
            CalibrationPoint::new(0.0, 0.0, 0.0),
            CalibrationPoint::new(65535.0, 40.0, 65535.0),
        ])
        .unwrap()
    }

    #[test]
    fn two_point_round_trip() {
        let calibration = two_point();
        let transform = CalibrationTransform::new(&calibration, SCALE, true);

        let raw = transform.to_raw(20.0);
        let value = transform.to_engineering(raw);
        assert!((value - 20.0).abs() <= 0.01);
    }

    #[test]
    fn piecewise_segments() {
        let calibration = CalibrationValue::from_points(&[
            CalibrationPoint::new(0.0, 0.0, 0.0),
            CalibrationPoint::new(1000.0, 1.0, 1024.0),
            CalibrationPoint::new(3000.0, 2.0, 3072.0),
        ])
        .unwrap();

        assert_eq!(calibration.value_to_dac(0.5), 500.0);
        assert_eq!(calibration.value_to_dac(1.5), 2000.0);
        assert_eq!(calibration.adc_to_value(2048.0), 1.5);

        // Extrapolation along the outer segments.
        assert_eq!(calibration.value_to_dac(3.0), 5000.0);
        assert_eq!(calibration.min(), 0.0);
        assert_eq!(calibration.max(), 2.0);
    }

    #[test]
    fn disabled_uses_hardware_scale() {
        let calibration = CalibrationValue::from_points(&[
            CalibrationPoint::new(0.0, 0.0, 0.0),
            CalibrationPoint::new(1000.0, 40.0, 1000.0),
        ])
        .unwrap();

        let transform = CalibrationTransform::new(&calibration, SCALE, false);
        assert_eq!(transform.to_raw(40.0), 65535);
        assert_eq!(transform.to_engineering(0), 0.0);

        let missing = CalibrationValue::default();
        let transform = CalibrationTransform::new(&missing, SCALE, true);
        assert_eq!(transform.to_raw(0.0), 0);
    }

    #[test]
    fn ground_offset_is_applied() {
        let scale = HardwareScale {
            ground_offset: 1.0,
            ..SCALE
        };
        let missing = CalibrationValue::default();
        let transform = CalibrationTransform::new(&missing, scale, false);
        assert_eq!(transform.to_raw(-1.0), 0);
        assert_eq!(transform.to_raw(100.0), 65535);
    }

    #[test]
    fn identity_matches_hardware_scale() {
        let identity = CalibrationValue::identity(&SCALE);
        assert!(!identity.exists());

        let nominal = CalibrationTransform::new(&identity, SCALE, true);
        assert_eq!(
            libm::roundf(identity.value_to_dac(12.5)) as u16,
            nominal.to_raw(12.5)
        );
    }

    #[test]
    fn rejects_bad_points() {
        assert_eq!(
            CalibrationValue::from_points(&[CalibrationPoint::new(0.0, 0.0, 0.0)]),
            Err(Error::Invalid)
        );
        assert_eq!(
            CalibrationValue::from_points(&[
                CalibrationPoint::new(0.0, 1.0, 0.0),
                CalibrationPoint::new(10.0, 0.5, 10.0),
            ]),
            Err(Error::Invalid)
        );

        let many = [CalibrationPoint::new(0.0, 0.0, 0.0); MAX_CALIBRATION_POINTS + 1];
        assert_eq!(CalibrationValue::from_points(&many), Err(Error::Bounds));
    }
}
