//! Platform constants of the PSU regulation core.

use super::{BoardParameters, Duration, Features};

/// Settling time between asserting the output synchronization signal and committing DAC values
/// of channels being enabled.
pub const OUTPUT_ENABLE_SETTLING_US: u32 = 3000;

/// Settling time after committing DAC values of channels being enabled.
pub const DAC_SETTLING_US: u32 = 500;

/// The largest configurable protection delay, in seconds.
pub const MAX_PROTECTION_DELAY: f32 = 300.0;

/// Parameters of a 40 V / 5 A dual-range channel module.
pub const DCP405: BoardParameters = BoardParameters {
    features: Features::VOLTAGE
        .union(Features::CURRENT)
        .union(Features::POWER)
        .union(Features::OUTPUT_ENABLE)
        .union(Features::DOWN_PROGRAMMER)
        .union(Features::REMOTE_SENSE)
        .union(Features::REMOTE_PROGRAMMING)
        .union(Features::REVERSE_POLARITY)
        .union(Features::CURRENT_DUAL_RANGE)
        .union(Features::HARDWARE_OVP)
        .union(Features::COUPLING),

    u_min: 0.0,
    u_default: 0.0,
    u_max: 40.0,

    i_min: 0.0,
    i_default: 0.0,
    i_max: 5.0,
    i_low_max: 0.05,

    p_total: 155.0,

    u_resolution: 0.005,
    u_resolution_calibrating: 0.0001,
    i_resolution: 0.0005,
    i_resolution_calibrating: 0.00001,
    i_low_resolution: 0.000005,
    i_low_resolution_calibrating: 0.0000001,
    p_resolution: 0.001,

    ovp_default_enabled: false,
    ovp_default_delay: 0.0,
    ocp_default_enabled: false,
    ocp_default_delay: 0.02,
    opp_default_enabled: true,
    opp_default_level: 155.0,
    opp_min_level: 0.0,
    opp_default_delay: 10.0,

    dac_max: 65535,
    adc_max: 65535,

    voltage_ground_offset: 0.86,
    current_ground_offset: 0.11,

    current_crossover: 0.05,
    range_switch_delay: Duration::millis(5),
};

/// Parameters of a 24 V / 4.9 A single-range channel module.
pub const DCM224: BoardParameters = BoardParameters {
    features: Features::VOLTAGE
        .union(Features::CURRENT)
        .union(Features::POWER)
        .union(Features::OUTPUT_ENABLE)
        .union(Features::COUPLING),

    u_min: 0.0,
    u_default: 0.0,
    u_max: 24.0,

    i_min: 0.0,
    i_default: 0.0,
    i_max: 4.9,
    i_low_max: 4.9,

    // Limited by U_MAX * I_MAX.
    p_total: 117.6,

    u_resolution: 0.01,
    u_resolution_calibrating: 0.001,
    i_resolution: 0.01,
    i_resolution_calibrating: 0.001,
    i_low_resolution: 0.01,
    i_low_resolution_calibrating: 0.001,
    p_resolution: 0.001,

    ovp_default_enabled: false,
    ovp_default_delay: 0.0,
    ocp_default_enabled: false,
    ocp_default_delay: 0.02,
    opp_default_enabled: true,
    opp_default_level: 80.0,
    opp_min_level: 0.0,
    opp_default_delay: 10.0,

    dac_max: 65535,
    adc_max: 65535,

    voltage_ground_offset: 0.0,
    current_ground_offset: 0.0,

    current_crossover: 0.05,
    range_switch_delay: Duration::millis(5),
};
