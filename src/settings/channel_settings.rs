//! PSU persisted channel settings

use miniconf::{Leaf, Tree};

use crate::{
    hardware::{
        current_range::CurrentRangeSelectionMode,
        platform,
        protection::{ProtectionKind, VoltageProtectionType},
        BoardParameters, Features,
    },
    Error,
};

/// Represents the user configuration of a channel.
///
/// # Note
/// Levels are given in engineering units (V, W), delays in seconds.
#[derive(Tree, Debug, Copy, Clone, PartialEq)]
pub struct ChannelSettings {
    pub ovp_enabled: Leaf<bool>,

    // V
    #[tree(validate=self.validate_ovp_level)]
    pub ovp_level: Leaf<f32>,

    // s
    #[tree(validate=self.validate_ovp_delay)]
    pub ovp_delay: Leaf<f32>,

    pub ovp_type: Leaf<VoltageProtectionType>,

    pub ocp_enabled: Leaf<bool>,

    // s
    #[tree(validate=self.validate_ocp_delay)]
    pub ocp_delay: Leaf<f32>,

    pub opp_enabled: Leaf<bool>,

    // W
    #[tree(validate=self.validate_opp_level)]
    pub opp_level: Leaf<f32>,

    // s
    #[tree(validate=self.validate_opp_delay)]
    pub opp_delay: Leaf<f32>,

    pub current_range_selection: Leaf<CurrentRangeSelectionMode>,

    pub auto_range: Leaf<bool>,

    pub calibration_enabled: Leaf<bool>,
}

fn check_delay(delay: f32) -> Result<(), &'static str> {
    if (0.0..=platform::MAX_PROTECTION_DELAY).contains(&delay) {
        Ok(())
    } else {
        Err("Protection delay out of range")
    }
}

impl ChannelSettings {
    /// Generate the factory default settings of a channel module.
    pub fn new(params: &BoardParameters) -> Self {
        let ovp_type = if params.has(Features::HARDWARE_OVP) {
            VoltageProtectionType::Hardware
        } else {
            VoltageProtectionType::Software
        };

        Self {
            ovp_enabled: Leaf::from(params.ovp_default_enabled),
            ovp_level: Leaf::from(params.u_max),
            ovp_delay: Leaf::from(params.ovp_default_delay),
            ovp_type: Leaf::from(ovp_type),

            ocp_enabled: Leaf::from(params.ocp_default_enabled),
            ocp_delay: Leaf::from(params.ocp_default_delay),

            opp_enabled: Leaf::from(params.opp_default_enabled),
            opp_level: Leaf::from(params.opp_default_level),
            opp_delay: Leaf::from(params.opp_default_delay),

            current_range_selection: Leaf::from(CurrentRangeSelectionMode::UseBoth),
            auto_range: Leaf::from(true),
            calibration_enabled: Leaf::from(false),
        }
    }

    /// Restore protection configuration to the factory defaults, leaving other settings as-is.
    pub fn reset_protection(&mut self, params: &BoardParameters) {
        let defaults = Self::new(params);
        self.ovp_enabled = defaults.ovp_enabled;
        self.ovp_level = defaults.ovp_level;
        self.ovp_delay = defaults.ovp_delay;
        self.ovp_type = defaults.ovp_type;
        self.ocp_enabled = defaults.ocp_enabled;
        self.ocp_delay = defaults.ocp_delay;
        self.opp_enabled = defaults.opp_enabled;
        self.opp_level = defaults.opp_level;
        self.opp_delay = defaults.opp_delay;
    }

    pub fn protection_enabled(&self, kind: ProtectionKind) -> bool {
        match kind {
            ProtectionKind::OverVoltage => *self.ovp_enabled,
            ProtectionKind::OverCurrent => *self.ocp_enabled,
            ProtectionKind::OverPower => *self.opp_enabled,
        }
    }

    pub fn set_protection_enabled(&mut self, kind: ProtectionKind, enabled: bool) {
        match kind {
            ProtectionKind::OverVoltage => *self.ovp_enabled = enabled,
            ProtectionKind::OverCurrent => *self.ocp_enabled = enabled,
            ProtectionKind::OverPower => *self.opp_enabled = enabled,
        }
    }

    /// Get the configured delay of a protection, in seconds.
    pub fn protection_delay(&self, kind: ProtectionKind) -> f32 {
        match kind {
            ProtectionKind::OverVoltage => *self.ovp_delay,
            ProtectionKind::OverCurrent => *self.ocp_delay,
            ProtectionKind::OverPower => *self.opp_delay,
        }
    }

    /// Check the settings against the limits of a channel module.
    pub fn check_bounds(&self, params: &BoardParameters) -> Result<(), Error> {
        if !(params.u_min..=params.u_max).contains(&*self.ovp_level) {
            return Err(Error::Bounds);
        }

        if !(params.opp_min_level..=params.p_total).contains(&*self.opp_level) {
            return Err(Error::Bounds);
        }

        if *self.ovp_type == VoltageProtectionType::Hardware && !params.has(Features::HARDWARE_OVP)
        {
            return Err(Error::Invalid);
        }

        if *self.current_range_selection == CurrentRangeSelectionMode::AlwaysLow
            && !params.has(Features::CURRENT_DUAL_RANGE)
        {
            return Err(Error::Invalid);
        }

        Ok(())
    }

    fn validate_ovp_level(&mut self, depth: usize) -> Result<usize, &'static str> {
        if *self.ovp_level >= 0.0 {
            Ok(depth)
        } else {
            Err("OVP level must not be negative")
        }
    }

    fn validate_opp_level(&mut self, depth: usize) -> Result<usize, &'static str> {
        if *self.opp_level >= 0.0 {
            Ok(depth)
        } else {
            Err("OPP level must not be negative")
        }
    }

    fn validate_ovp_delay(&mut self, depth: usize) -> Result<usize, &'static str> {
        check_delay(*self.ovp_delay).map(|_| depth)
    }

    fn validate_ocp_delay(&mut self, depth: usize) -> Result<usize, &'static str> {
        check_delay(*self.ocp_delay).map(|_| depth)
    }

    fn validate_opp_delay(&mut self, depth: usize) -> Result<usize, &'static str> {
        check_delay(*self.opp_delay).map(|_| depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_board() {
        let settings = ChannelSettings::new(&platform::DCP405);
        assert_eq!(*settings.ovp_level, 40.0);
        assert_eq!(*settings.ovp_type, VoltageProtectionType::Hardware);
        assert_eq!(*settings.opp_level, 155.0);
        assert!(settings.protection_enabled(ProtectionKind::OverPower));
        assert_eq!(settings.check_bounds(&platform::DCP405), Ok(()));

        let settings = ChannelSettings::new(&platform::DCM224);
        assert_eq!(*settings.ovp_type, VoltageProtectionType::Software);
        assert_eq!(settings.protection_delay(ProtectionKind::OverCurrent), 0.02);
        assert_eq!(settings.check_bounds(&platform::DCM224), Ok(()));
    }

    #[test]
    fn bounds() {
        let mut settings = ChannelSettings::new(&platform::DCM224);
        *settings.ovp_level = 30.0;
        assert_eq!(settings.check_bounds(&platform::DCM224), Err(Error::Bounds));

        let mut settings = ChannelSettings::new(&platform::DCM224);
        *settings.ovp_type = VoltageProtectionType::Hardware;
        assert_eq!(settings.check_bounds(&platform::DCM224), Err(Error::Invalid));
    }

    #[test]
    fn reset_protection_keeps_range_policy() {
        let mut settings = ChannelSettings::new(&platform::DCP405);
        *settings.current_range_selection = CurrentRangeSelectionMode::AlwaysLow;
        *settings.ocp_enabled = true;
        settings.reset_protection(&platform::DCP405);
        assert!(!*settings.ocp_enabled);
        assert_eq!(
            *settings.current_range_selection,
            CurrentRangeSelectionMode::AlwaysLow
        );
    }
}
