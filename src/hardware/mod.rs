//! PSU module-level hardware definitions
//!
//! # Note
//! The regulation core never touches registers. Everything it needs from the analog front end
//! is expressed through [ChannelDriver], and everything it needs from the surrounding firmware
//! through [Board].

use bit_field::BitField;
use bitflags::bitflags;
use embedded_hal::delay::DelayNs;
use enum_iterator::Sequence;
use serde::{Deserialize, Serialize};

use crate::{
    calibration::{CalibrationConfiguration, HardwareScale},
    events::EventSink,
    settings::ChannelSettings,
};

pub mod current_range;
pub mod inhibit;
pub mod output_sync;
pub mod platform;
pub mod protection;
pub mod psu_channel;
pub mod psu_channels;

use current_range::CurrentRange;
use output_sync::{OutputEnableTasks, SyncPhase};

/// Time base of the regulation task, with microsecond resolution.
pub type Instant = fugit::TimerInstantU64<1_000_000>;
pub type Duration = fugit::MicrosDurationU64;

/// The number of channel slots managed by the regulation core.
pub const MAX_CHANNELS: usize = 6;

/// Indicates a PSU output channel.
#[derive(Sequence, Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    Zero = 0,
    One = 1,
    Two = 2,
    Three = 3,
    Four = 4,
    Five = 5,
}

impl core::fmt::Display for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Channels are numbered from one on the front panel.
        write!(f, "CH{}", *self as usize + 1)
    }
}

/// A set of channels.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ChannelMask(u8);

impl ChannelMask {
    pub const fn empty() -> Self {
        ChannelMask(0)
    }

    pub fn all() -> Self {
        enum_iterator::all::<Channel>().collect()
    }

    pub fn insert(&mut self, channel: Channel) {
        self.0.set_bit(channel as usize, true);
    }

    pub fn remove(&mut self, channel: Channel) {
        self.0.set_bit(channel as usize, false);
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.0.get_bit(channel as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate over the channels in the set, in ascending order.
    pub fn iter(self) -> impl Iterator<Item = Channel> {
        enum_iterator::all::<Channel>().filter(move |channel| self.contains(*channel))
    }
}

impl From<Channel> for ChannelMask {
    fn from(channel: Channel) -> Self {
        let mut mask = ChannelMask::empty();
        mask.insert(channel);
        mask
    }
}

impl FromIterator<Channel> for ChannelMask {
    fn from_iter<I: IntoIterator<Item = Channel>>(iter: I) -> Self {
        let mut mask = ChannelMask::empty();
        for channel in iter {
            mask.insert(channel);
        }
        mask
    }
}

bitflags! {
    /// Capabilities of a channel module.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u16 {
        const VOLTAGE               = 1<<0;
        const CURRENT               = 1<<1;
        const POWER                 = 1<<2;
        const OUTPUT_ENABLE         = 1<<3;
        const DOWN_PROGRAMMER       = 1<<4;
        const REMOTE_SENSE          = 1<<5;
        const REMOTE_PROGRAMMING    = 1<<6;
        const REVERSE_POLARITY      = 1<<7;
        const CURRENT_DUAL_RANGE    = 1<<8;
        const HARDWARE_OVP          = 1<<9;
        const COUPLING              = 1<<10;
    }
}

/// Read-only description of a channel module, supplied by its driver.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BoardParameters {
    pub features: Features,

    // V
    pub u_min: f32,
    pub u_default: f32,
    pub u_max: f32,

    // A
    pub i_min: f32,
    pub i_default: f32,
    pub i_max: f32,

    /// The largest current of the low current range, in A.
    pub i_low_max: f32,

    /// The total power the channel can deliver, in W.
    pub p_total: f32,

    pub u_resolution: f32,
    pub u_resolution_calibrating: f32,
    pub i_resolution: f32,
    pub i_resolution_calibrating: f32,
    pub i_low_resolution: f32,
    pub i_low_resolution_calibrating: f32,
    pub p_resolution: f32,

    pub ovp_default_enabled: bool,
    // s
    pub ovp_default_delay: f32,

    pub ocp_default_enabled: bool,
    // s
    pub ocp_default_delay: f32,

    pub opp_default_enabled: bool,
    // W
    pub opp_default_level: f32,
    pub opp_min_level: f32,
    // s
    pub opp_default_delay: f32,

    /// Full-scale DAC code.
    pub dac_max: u16,
    /// Full-scale ADC code.
    pub adc_max: u16,

    pub voltage_ground_offset: f32,
    pub current_ground_offset: f32,

    /// Set or measured currents above this value require the high current range.
    pub current_crossover: f32,

    /// The minimum interval between two current range changes while output is enabled.
    pub range_switch_delay: Duration,
}

impl BoardParameters {
    pub fn has(&self, features: Features) -> bool {
        self.features.contains(features)
    }

    /// Get the nominal converter scaling of the voltage path.
    pub fn voltage_scale(&self) -> HardwareScale {
        HardwareScale {
            full_scale: self.u_max,
            dac_max: self.dac_max,
            adc_max: self.adc_max,
            ground_offset: self.voltage_ground_offset,
        }
    }

    /// Get the nominal converter scaling of the current path in a range.
    pub fn current_scale(&self, range: CurrentRange) -> HardwareScale {
        match range {
            CurrentRange::High => HardwareScale {
                full_scale: self.i_max,
                dac_max: self.dac_max,
                adc_max: self.adc_max,
                ground_offset: self.current_ground_offset,
            },
            CurrentRange::Low => HardwareScale {
                full_scale: self.i_low_max,
                dac_max: self.dac_max,
                adc_max: self.adc_max,
                ground_offset: self.current_ground_offset * self.i_low_max / self.i_max,
            },
        }
    }
}

/// The outcome of a channel hardware self-test.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum TestResult {
    NotTested,
    Passed,
    Failed,
}

/// The source of an ADC conversion result.
///
/// # Note
/// Conversions of a channel cycle through the variants in declaration order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum AdcDataType {
    VoltageMonitor,
    CurrentMonitor,
    VoltageDac,
    CurrentDac,
}

impl AdcDataType {
    /// Get the conversion that follows this one.
    pub fn next(self) -> Self {
        match self {
            AdcDataType::VoltageMonitor => AdcDataType::CurrentMonitor,
            AdcDataType::CurrentMonitor => AdcDataType::VoltageDac,
            AdcDataType::VoltageDac => AdcDataType::CurrentDac,
            AdcDataType::CurrentDac => AdcDataType::VoltageMonitor,
        }
    }
}

/// Access to the analog front end of a single channel.
pub trait ChannelDriver {
    /// Prepare the hardware after enumeration.
    fn init(&mut self) {}

    /// Run the hardware self-test.
    fn test(&mut self) -> TestResult;

    /// Get the result of the most recent self-test.
    fn test_result(&self) -> TestResult;

    /// Periodic service, called once per regulation tick.
    fn tick(&mut self, _now: Instant) {}

    fn set_dac_voltage(&mut self, code: u16);
    fn set_dac_current(&mut self, code: u16);

    /// Commit part of an output enable transition.
    ///
    /// # Args
    /// * `enable` - The hardware output state being transitioned to.
    /// * `tasks` - The parts of the transition to perform now.
    fn set_output_enable(&mut self, enable: bool, tasks: OutputEnableTasks);

    fn set_remote_sense(&mut self, enable: bool);
    fn set_remote_programming(&mut self, enable: bool);
    fn set_current_range(&mut self, range: CurrentRange);

    /// Start conversions of all monitored quantities.
    fn adc_measure_all(&mut self);

    /// Start conversions of the DAC read-back quantities.
    fn adc_measure_mon_dac(&mut self);

    fn is_cv_mode(&self) -> bool;
    fn is_cc_mode(&self) -> bool;

    fn is_power_ok(&self) -> bool {
        true
    }

    /// Check for reversed remote sense wiring.
    fn is_reverse_polarity(&self) -> bool {
        false
    }
}

/// Storage of channel configuration.
pub trait Persistence {
    /// Request the configuration of a channel be stored.
    ///
    /// # Note
    /// Implementations are expected to debounce and write asynchronously.
    fn save(&mut self, channel: Channel, settings: &ChannelSettings);

    /// Load stored channel configuration, if there is any.
    fn load_settings(&mut self, channel: Channel) -> Option<ChannelSettings>;

    /// Load stored calibration data, if there is any.
    fn load_calibration(&mut self, channel: Channel) -> Option<CalibrationConfiguration>;
}

/// The shared output synchronization signal.
pub trait SyncCommit {
    /// Called at every phase boundary of an output enable transaction.
    fn commit(&mut self, phase: SyncPhase);
}

/// A monotonic time source.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Everything the regulation core needs from the surrounding firmware.
pub trait Board: DelayNs + EventSink + Persistence + SyncCommit + Clock {}

impl<T> Board for T where T: DelayNs + EventSink + Persistence + SyncCommit + Clock {}
