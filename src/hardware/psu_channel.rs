//! Definitions for PSU output channels.

use enum_iterator::all;

use super::{
    current_range::{
        AutoRangeInputs, CurrentRange, CurrentRangeController, CurrentRangeSelectionMode,
        RangeAction,
    },
    output_sync::OutputEnableTasks,
    protection::{
        delay_from_secs, ProtectionKind, ProtectionState, ProtectionValue, VoltageProtectionType,
    },
    AdcDataType, BoardParameters, Channel, ChannelDriver, Features, Instant, Persistence,
    TestResult,
};
use crate::{
    calibration::{CalibrationConfiguration, CalibrationTransform},
    events::{Event, EventSink},
    filter::round_prec,
    regulated_value::RegulatedValue,
    settings::ChannelSettings,
    status::{OperBit, QuesBit, StatusRegisters},
};

/// Runtime state flags of a channel.
#[derive(Debug, Copy, Clone, Default)]
struct ChannelFlags {
    /// The output state visible to the user.
    output_enabled: bool,
    /// The output state last committed to the hardware.
    hardware_enabled: bool,
    sense_enabled: bool,
    rprog_enabled: bool,
    cv_mode: bool,
    cc_mode: bool,
    tracking: bool,
    calibrating: bool,
    dac_testing: bool,
    reverse_polarity: bool,
    sync_pending: bool,
    sync_target: bool,
}

/// Measured and configured quantities of a channel, as reported to the user.
#[derive(Copy, Clone, serde::Serialize)]
pub struct ChannelStatus {
    pub voltage: f32,
    pub current: f32,
    pub power: f32,
    pub voltage_set: f32,
    pub current_set: f32,
    pub output_enabled: bool,
    pub current_range: CurrentRange,
    pub ovp: ProtectionState,
    pub ocp: ProtectionState,
    pub opp: ProtectionState,
    pub questionable: u16,
    pub operation: u16,
    pub state: sm::States,
}

/// Represents a single PSU output channel.
pub struct PsuChannel<D> {
    channel: Channel,
    slot: u8,
    subchannel: u8,
    params: BoardParameters,
    driver: D,

    u: RegulatedValue,
    i: RegulatedValue,
    p_limit: f32,

    settings: ChannelSettings,
    settings_dirty: bool,
    calibration: CalibrationConfiguration,

    protections: [ProtectionValue; 3],
    range: CurrentRangeController,
    flags: ChannelFlags,
    status: StatusRegisters,
}

fn ques_bit(kind: ProtectionKind) -> QuesBit {
    match kind {
        ProtectionKind::OverVoltage => QuesBit::OverVoltage,
        ProtectionKind::OverCurrent => QuesBit::OverCurrent,
        ProtectionKind::OverPower => QuesBit::OverPower,
    }
}

impl<D: ChannelDriver> PsuChannel<D> {
    /// Construct a new channel.
    ///
    /// # Args
    /// * `channel` - The index of the channel.
    /// * `params` - The description of the channel module.
    /// * `driver` - Access to the channel's analog front end.
    pub fn new(channel: Channel, params: BoardParameters, driver: D) -> Self {
        let mut status = StatusRegisters::default();
        status.set_oper_bit(OperBit::OutputOff, true);

        Self {
            channel,
            slot: 0,
            subchannel: 0,
            params,
            driver,
            u: RegulatedValue::new(params.u_min, params.u_default, params.u_max),
            i: RegulatedValue::new(params.i_min, params.i_default, params.i_max),
            p_limit: params.p_total,
            settings: ChannelSettings::new(&params),
            settings_dirty: false,
            calibration: CalibrationConfiguration::identity(&params),
            protections: [ProtectionValue::default(); 3],
            range: CurrentRangeController::new(),
            flags: ChannelFlags::default(),
            status,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Get the physical slot and sub-channel the channel was installed at.
    pub fn location(&self) -> (u8, u8) {
        (self.slot, self.subchannel)
    }

    pub fn params(&self) -> &BoardParameters {
        &self.params
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    pub fn calibration(&self) -> &CalibrationConfiguration {
        &self.calibration
    }

    pub fn voltage(&self) -> &RegulatedValue {
        &self.u
    }

    pub fn current(&self) -> &RegulatedValue {
        &self.i
    }

    pub fn power_limit(&self) -> f32 {
        self.p_limit
    }

    pub fn current_range(&self) -> CurrentRange {
        self.range.range()
    }

    pub fn status_registers(&self) -> &StatusRegisters {
        &self.status
    }

    pub fn is_output_enabled(&self) -> bool {
        self.flags.output_enabled
    }

    pub fn is_remote_sense_enabled(&self) -> bool {
        self.flags.sense_enabled
    }

    pub fn is_remote_programming_enabled(&self) -> bool {
        self.flags.rprog_enabled
    }

    pub fn is_tracking(&self) -> bool {
        self.flags.tracking
    }

    pub fn is_cv_mode(&self) -> bool {
        self.flags.cv_mode
    }

    pub fn is_cc_mode(&self) -> bool {
        self.flags.cc_mode
    }

    pub fn protection(&self, kind: ProtectionKind) -> ProtectionState {
        self.protections[kind as usize].state()
    }

    /// Check if any protection is latched.
    pub fn is_tripped(&self) -> bool {
        self.protections.iter().any(ProtectionValue::is_tripped)
    }

    /// Check if the persisted configuration changed since the last call.
    pub fn take_settings_dirty(&mut self) -> bool {
        core::mem::take(&mut self.settings_dirty)
    }

    fn dual_range(&self) -> bool {
        self.params.has(Features::CURRENT_DUAL_RANGE)
    }

    fn range_mode(&self) -> CurrentRangeSelectionMode {
        *self.settings.current_range_selection
    }

    fn calibration_enabled(&self) -> bool {
        *self.settings.calibration_enabled
    }

    /// Get the resolution of voltage values.
    pub fn voltage_resolution(&self) -> f32 {
        if self.flags.calibrating {
            self.params.u_resolution_calibrating
        } else {
            self.params.u_resolution
        }
    }

    /// Get the resolution used for a current setpoint.
    ///
    /// # Note
    /// Small currents are programmed with the resolution of the low range when it is available.
    pub fn current_resolution_for(&self, value: f32) -> f32 {
        let low = self.dual_range()
            && self.range_mode() != CurrentRangeSelectionMode::AlwaysHigh
            && value <= self.params.current_crossover;

        self.range_resolution(if low {
            CurrentRange::Low
        } else {
            CurrentRange::High
        })
    }

    fn range_resolution(&self, range: CurrentRange) -> f32 {
        match (range, self.flags.calibrating) {
            (CurrentRange::High, false) => self.params.i_resolution,
            (CurrentRange::High, true) => self.params.i_resolution_calibrating,
            (CurrentRange::Low, false) => self.params.i_low_resolution,
            (CurrentRange::Low, true) => self.params.i_low_resolution_calibrating,
        }
    }

    fn voltage_transform(&self) -> CalibrationTransform<'_> {
        CalibrationTransform::new(
            &self.calibration.voltage,
            self.params.voltage_scale(),
            self.calibration_enabled(),
        )
    }

    fn current_transform(&self, range: CurrentRange) -> CalibrationTransform<'_> {
        CalibrationTransform::new(
            self.calibration.current(range),
            self.params.current_scale(range),
            self.calibration_enabled(),
        )
    }

    /// Get the largest voltage limit the channel currently permits.
    pub fn voltage_max_limit(&self) -> f32 {
        let calibration = &self.calibration.voltage;
        if self.calibration_enabled() && calibration.exists() {
            self.params.u_max.min(calibration.max())
        } else {
            self.params.u_max
        }
    }

    /// Get the largest current limit the channel currently permits.
    pub fn current_max_limit(&self) -> f32 {
        if self.dual_range() && self.range_mode() == CurrentRangeSelectionMode::AlwaysLow {
            return self.params.i_low_max;
        }

        let calibration = &self.calibration.current_high;
        if self.calibration_enabled() && calibration.exists() {
            self.params.i_max.min(calibration.max())
        } else {
            self.params.i_max
        }
    }

    /// Program the output voltage.
    ///
    /// # Note
    /// The value is clamped to the voltage limit. Raising the voltage above the OVP level raises
    /// the OVP level along with it.
    pub fn set_voltage(&mut self, value: f32) {
        let value = if self.flags.calibrating {
            value
        } else {
            round_prec(value, self.voltage_resolution())
        };
        self.apply_voltage(value);
    }

    fn apply_voltage(&mut self, value: f32) {
        let set = self.u.set_value(value);
        self.u.dac_readback.reset();

        if *self.settings.ovp_level < set {
            *self.settings.ovp_level = set;
            self.settings_dirty = true;
        }

        let code = self.voltage_transform().to_raw(set);
        self.driver.set_dac_voltage(code);
    }

    /// Program the output current.
    ///
    /// # Note
    /// The value is clamped to the current limit. The current range is selected for the new
    /// setpoint.
    pub fn set_current(&mut self, value: f32, now: Instant) {
        let value = if self.flags.calibrating {
            value
        } else {
            round_prec(value, self.current_resolution_for(value))
        };
        self.apply_current(value, now);
    }

    fn apply_current(&mut self, value: f32, now: Instant) {
        let set = self.i.set_value(value);

        if self.dual_range() && !self.flags.calibrating {
            let desired = self
                .range_mode()
                .range_for(set, self.params.current_crossover);
            if let Some(range) = self.range.select(
                desired,
                now,
                self.flags.hardware_enabled,
                self.params.range_switch_delay,
            ) {
                self.switch_range(range);
            }
        }

        self.i.dac_readback.reset();
        self.write_current_dac(set);
    }

    fn switch_range(&mut self, range: CurrentRange) {
        debug!("{}: Current range {:?}", self.channel, range);
        self.driver.set_current_range(range);
        self.i.monitor.reset();
    }

    fn write_current_dac(&mut self, value: f32) {
        let code = self.current_transform(self.range.range()).to_raw(value);
        self.driver.set_dac_current(code);
    }

    pub fn set_voltage_limit(&mut self, limit: f32) {
        let limit = round_prec(limit, self.voltage_resolution());
        if self.u.set_limit(limit, self.voltage_max_limit()) {
            self.apply_voltage(self.u.set());
        }
    }

    pub fn set_current_limit(&mut self, limit: f32, now: Instant) {
        let limit = round_prec(limit, self.current_resolution_for(limit));
        if self.i.set_limit(limit, self.current_max_limit()) {
            self.apply_current(self.i.set(), now);
        }
    }

    /// Configure the power limit.
    ///
    /// # Note
    /// If the programmed setpoints exceed the new limit, the current setpoint is reduced.
    pub fn set_power_limit(&mut self, limit: f32, now: Instant) {
        self.p_limit = round_prec(limit, self.params.p_resolution).clamp(0.0, self.params.p_total);

        let voltage = self.u.set();
        if voltage > 0.0 && voltage * self.i.set() > self.p_limit {
            self.set_current(self.p_limit / voltage, now);
        }
    }

    /// Apply a new current range selection policy.
    fn apply_range_mode(&mut self, now: Instant) {
        if self.range_mode() == CurrentRangeSelectionMode::AlwaysLow {
            self.i.set_limit(self.i.limit(), self.current_max_limit());
        }
        self.apply_current(self.i.set(), now);
    }

    /// Turn the remote sense inputs on or off.
    ///
    /// # Note
    /// Requires remote sense and reverse polarity detection support.
    pub fn set_remote_sense(&mut self, enable: bool, events: &mut impl EventSink) {
        if !self
            .params
            .has(Features::REMOTE_SENSE | Features::REVERSE_POLARITY)
        {
            return;
        }

        let changed = self.flags.sense_enabled != enable;
        self.flags.sense_enabled = enable;
        self.driver.set_remote_sense(enable);
        self.status.set_oper_bit(OperBit::RemoteSense, enable);

        if changed {
            events.push_event(if enable {
                Event::RemoteSenseEnabled(self.channel)
            } else {
                Event::RemoteSenseDisabled(self.channel)
            });
        }
    }

    /// Turn remote programming of the output voltage on or off.
    ///
    /// # Note
    /// Enabling remote programming opens the voltage limit, the OVP level and the power limit to
    /// their maxima and programs the minimum voltage.
    pub fn set_remote_programming(
        &mut self,
        enable: bool,
        now: Instant,
        events: &mut impl EventSink,
    ) {
        if !self.params.has(Features::REMOTE_PROGRAMMING) {
            return;
        }

        let changed = self.flags.rprog_enabled != enable;
        self.flags.rprog_enabled = enable;

        if enable {
            self.set_voltage_limit(self.params.u_max);
            self.set_voltage(self.params.u_min);
            if *self.settings.ovp_level != self.params.u_max || !*self.settings.ovp_enabled {
                *self.settings.ovp_level = self.params.u_max;
                *self.settings.ovp_enabled = true;
                self.settings_dirty = true;
            }
            self.set_power_limit(self.params.p_total, now);
        }

        self.driver.set_remote_programming(enable);
        self.status.set_oper_bit(OperBit::RemoteProgramming, enable);

        if changed {
            events.push_event(if enable {
                Event::RemoteProgrammingEnabled(self.channel)
            } else {
                Event::RemoteProgrammingDisabled(self.channel)
            });
        }
    }

    /// Enable or disable use of the stored calibration.
    ///
    /// # Note
    /// Calibration can only be enabled if calibration data exists.
    pub fn set_calibration_enabled(
        &mut self,
        enable: bool,
        now: Instant,
        events: &mut impl EventSink,
    ) {
        let enable = enable && self.calibration.any_exists();
        if self.calibration_enabled() == enable {
            return;
        }

        *self.settings.calibration_enabled = enable;
        self.settings_dirty = true;
        self.reapply_setpoints(now);

        info!(
            "{}: Calibration {}",
            self.channel,
            if enable { "enabled" } else { "disabled" }
        );
        events.push_event(if enable {
            Event::CalibrationEnabled(self.channel)
        } else {
            Event::CalibrationDisabled(self.channel)
        });
    }

    /// Replace the calibration data of the channel.
    pub fn set_calibration(&mut self, calibration: CalibrationConfiguration, now: Instant) {
        self.calibration = calibration;
        if self.calibration_enabled() && !self.calibration.any_exists() {
            *self.settings.calibration_enabled = false;
            self.settings_dirty = true;
        }
        self.reapply_setpoints(now);
    }

    /// Indicate a calibration procedure is running on the channel.
    ///
    /// # Note
    /// Setpoints are not rounded while calibrating and finer measurement resolutions apply.
    pub fn set_calibrating(&mut self, calibrating: bool) {
        self.flags.calibrating = calibrating;
        self.status.set_oper_bit(OperBit::Calibrating, calibrating);
    }

    /// Indicate the DACs are being exercised by a hardware test.
    pub fn set_dac_testing(&mut self, testing: bool) {
        self.flags.dac_testing = testing;
    }

    pub(crate) fn set_tracking(&mut self, tracking: bool) {
        self.flags.tracking = tracking;
    }

    /// Re-apply limits and setpoints, e.g. after the calibration state changed.
    pub(crate) fn reapply_setpoints(&mut self, now: Instant) {
        self.u.set_limit(self.u.limit(), self.voltage_max_limit());
        self.i.set_limit(self.i.limit(), self.current_max_limit());
        self.apply_voltage(self.u.set());
        self.apply_current(self.i.set(), now);
    }

    /// Re-apply the remote sense and remote programming state to the hardware.
    pub(crate) fn reapply_modes(&mut self) {
        if self
            .params
            .has(Features::REMOTE_SENSE | Features::REVERSE_POLARITY)
        {
            self.driver.set_remote_sense(self.flags.sense_enabled);
        }

        if self.params.has(Features::REMOTE_PROGRAMMING) {
            self.driver.set_remote_programming(self.flags.rprog_enabled);
        }
    }

    /// Apply new user configuration.
    ///
    /// # Note
    /// The settings are expected to be validated against the board already.
    pub fn apply_settings(
        &mut self,
        settings: &ChannelSettings,
        now: Instant,
        events: &mut impl EventSink,
    ) {
        let mode_changed = *self.settings.current_range_selection
            != *settings.current_range_selection
            || *self.settings.auto_range != *settings.auto_range;
        let calibration_enabled = *settings.calibration_enabled;

        self.settings = ChannelSettings {
            calibration_enabled: self.settings.calibration_enabled,
            ..*settings
        };
        self.settings_dirty = true;

        if mode_changed {
            self.apply_range_mode(now);
        }

        self.set_calibration_enabled(calibration_enabled, now, events);
    }

    /// Handle a conversion result from the channel's ADC.
    ///
    /// # Args
    /// * `kind` - The quantity that was converted.
    /// * `raw` - The ADC code.
    /// * `inhibited` - Whether outputs are held off by the inhibit input.
    ///
    /// # Returns
    /// The quantity to convert next.
    pub fn on_adc_data(&mut self, kind: AdcDataType, raw: u16, inhibited: bool) -> AdcDataType {
        match kind {
            AdcDataType::VoltageMonitor if inhibited => self.u.monitor.hold_zero(),
            AdcDataType::CurrentMonitor if inhibited => self.i.monitor.hold_zero(),
            AdcDataType::VoltageMonitor => {
                let value = self.voltage_transform().to_engineering(raw);
                let resolution = self.voltage_resolution();
                self.u.monitor.add_sample(value, resolution);
            }
            AdcDataType::CurrentMonitor => {
                let range = self.range.range();
                let value = self.current_transform(range).to_engineering(raw);
                let resolution = self.range_resolution(range);
                self.i.monitor.add_sample(value, resolution);
            }
            AdcDataType::VoltageDac => {
                let value = self.voltage_transform().to_engineering(raw);
                let resolution = self.voltage_resolution();
                self.u.dac_readback.add_sample(value, resolution);
            }
            AdcDataType::CurrentDac => {
                let range = self.range.range();
                let value = self.current_transform(range).to_engineering(raw);
                let resolution = self.range_resolution(range);
                self.i.dac_readback.add_sample(value, resolution);
            }
        }

        kind.next()
    }

    fn protection_active(&self, kind: ProtectionKind) -> bool {
        if !self.flags.hardware_enabled {
            return false;
        }

        match kind {
            ProtectionKind::OverVoltage => {
                let enforced_in_hardware = self.params.has(Features::HARDWARE_OVP)
                    && *self.settings.ovp_type == VoltageProtectionType::Hardware
                    && !self.flags.rprog_enabled;

                (self.flags.rprog_enabled || *self.settings.ovp_enabled) && !enforced_in_hardware
            }
            kind => self.settings.protection_enabled(kind),
        }
    }

    fn protection_condition(&self, kind: ProtectionKind) -> bool {
        let (u, i) = (&self.u.monitor, &self.i.monitor);

        match kind {
            ProtectionKind::OverVoltage => {
                let level = *self.settings.ovp_level;
                let readback = &self.u.dac_readback;

                (u.is_measured() && u.last() >= level)
                    || (self.flags.rprog_enabled
                        && readback.is_measured()
                        && readback.last() >= level)
            }
            ProtectionKind::OverCurrent => i.is_measured() && i.last() >= self.i.set(),
            ProtectionKind::OverPower => {
                u.is_measured() && i.is_measured() && u.last() * i.last() > *self.settings.opp_level
            }
        }
    }

    /// Evaluate all protections of the channel.
    ///
    /// # Note
    /// At most one protection trips per evaluation. Once one has tripped, the output is about to
    /// be disabled and the remaining protections are treated as inactive.
    ///
    /// # Returns
    /// The protection that tripped during this evaluation, if any.
    pub fn check_protection(&mut self, now: Instant) -> Option<ProtectionKind> {
        let mut tripped = None;

        for kind in all::<ProtectionKind>() {
            let active = tripped.is_none() && self.protection_active(kind);
            let condition = active && self.protection_condition(kind);
            let delay = delay_from_secs(self.settings.protection_delay(kind));

            if self.protections[kind as usize].check(active, condition, delay, now) {
                tripped.replace(kind);
            }
        }

        tripped
    }

    /// Record a protection trip.
    ///
    /// # Note
    /// The caller is responsible for disabling the output.
    pub fn on_protection_tripped(
        &mut self,
        kind: ProtectionKind,
        now: Instant,
        events: &mut impl EventSink,
    ) {
        warn!("{}: {:?} protection tripped", self.channel, kind);
        self.status.set_ques_bit(ques_bit(kind), true);
        events.push_event(Event::ProtectionTripped(self.channel, kind));

        if kind == ProtectionKind::OverVoltage
            && self.flags.rprog_enabled
            && *self.settings.ovp_level >= self.params.u_max
        {
            warn!("{}: Remote programming alarm", self.channel);
            events.push_event(Event::RemoteProgrammingAlarm(self.channel));
        }

        if kind == ProtectionKind::OverVoltage {
            self.set_remote_programming(false, now, events);
        }
    }

    /// Clear all latched protections and acknowledge their events.
    pub fn clear_protection(&mut self, events: &mut impl EventSink) {
        for kind in all::<ProtectionKind>() {
            let protection = &mut self.protections[kind as usize];
            if protection.is_tripped() {
                events.acknowledge(Event::ProtectionTripped(self.channel, kind));
            }
            protection.clear();
            self.status.set_ques_bit(ques_bit(kind), false);
        }
    }

    /// Disable all protections.
    ///
    /// # Note
    /// Does nothing while a protection is latched.
    pub fn disable_protection(&mut self) {
        if self.is_tripped() {
            return;
        }

        for kind in all::<ProtectionKind>() {
            self.settings.set_protection_enabled(kind, false);
        }
        self.settings_dirty = true;
    }

    fn update_regulation_mode(&mut self, cv: bool, cc: bool) {
        if cv != self.flags.cv_mode {
            self.flags.cv_mode = cv;
            self.status.set_oper_bit(OperBit::ConstantVoltage, cv);
            self.status.set_ques_bit(QuesBit::Current, cv);
        }

        if cc != self.flags.cc_mode {
            self.flags.cc_mode = cc;
            self.status.set_oper_bit(OperBit::ConstantCurrent, cc);
            self.status.set_ques_bit(QuesBit::Voltage, cc);
        }
    }

    fn service_current_range(&mut self, now: Instant) {
        if !self.dual_range() {
            return;
        }

        let inputs = AutoRangeInputs {
            output_enabled: self.flags.hardware_enabled,
            allowed: *self.settings.auto_range
                && self.range_mode() == CurrentRangeSelectionMode::UseBoth
                && !self.flags.calibrating
                && !self.flags.dac_testing,
            current_set: self.i.set(),
            current_measured: self
                .i
                .monitor
                .is_measured()
                .then(|| self.i.monitor.last()),
            cc_mode: self.flags.cc_mode,
            crossover: self.params.current_crossover,
        };

        match self
            .range
            .poll(now, &inputs, self.params.range_switch_delay)
        {
            Some(RangeAction::Select(range)) => {
                self.switch_range(range);
                self.write_current_dac(self.i.set());
            }
            Some(RangeAction::SwitchToLow) => {
                self.switch_range(CurrentRange::Low);
                self.driver.set_dac_current(self.params.dac_max);
            }
            Some(RangeAction::ReapplySetpoint) => self.apply_current(self.i.set(), now),
            None => {}
        }
    }

    /// Periodic service of the channel.
    ///
    /// # Args
    /// * `now` - The current time.
    /// * `inhibited` - Whether outputs are held off by the inhibit input.
    ///
    /// # Returns
    /// True if reversed sense wiring was detected on an enabled output.
    pub fn tick(&mut self, now: Instant, inhibited: bool) -> bool {
        self.driver.tick(now);

        if self.params.has(Features::REVERSE_POLARITY) {
            let reversed = self.driver.is_reverse_polarity();
            if reversed != self.flags.reverse_polarity {
                self.flags.reverse_polarity = reversed;
                self.status.set_ques_bit(QuesBit::ReversePolarity, reversed);
            }
        }

        if !inhibited {
            let (cv, cc) = (self.driver.is_cv_mode(), self.driver.is_cc_mode());
            self.update_regulation_mode(cv, cc);
        }

        self.service_current_range(now);

        self.flags.reverse_polarity && self.flags.output_enabled
    }

    /// Start conversions of all monitored quantities.
    pub fn measure_all(&mut self) {
        self.driver.adc_measure_all();
        self.driver.adc_measure_mon_dac();
    }

    /// Request an output state change with the next synchronized transaction.
    pub(crate) fn request_output(&mut self, enable: bool) {
        self.flags.sync_pending = enable != self.flags.output_enabled;
        self.flags.sync_target = enable;
    }

    /// Request the current output state be re-applied with the next synchronized transaction.
    pub(crate) fn request_refresh(&mut self) {
        self.flags.sync_pending = true;
        self.flags.sync_target = self.flags.output_enabled;
    }

    pub(crate) fn sync_request(&self) -> Option<bool> {
        self.flags.sync_pending.then_some(self.flags.sync_target)
    }

    pub(crate) fn commit_output(&mut self, enable: bool, tasks: OutputEnableTasks) {
        self.driver.set_output_enable(enable, tasks);
    }

    /// Complete a synchronized output transaction.
    ///
    /// # Args
    /// * `target` - The output state visible to the user.
    /// * `hardware` - The output state committed to the hardware.
    ///
    /// # Returns
    /// The event to report if the visible state changed.
    pub(crate) fn finish_sync(&mut self, target: bool, hardware: bool) -> Option<Event> {
        self.flags.sync_pending = false;
        self.flags.hardware_enabled = hardware;

        self.u.reset_monitor();
        self.i.reset_monitor();
        self.status.set_oper_bit(OperBit::OutputOff, !hardware);
        if !hardware {
            self.update_regulation_mode(false, false);
        }

        if self.flags.output_enabled == target {
            return None;
        }

        self.flags.output_enabled = target;
        Some(if target {
            Event::OutputEnabled(self.channel)
        } else {
            Event::OutputDisabled(self.channel)
        })
    }

    /// Restore the default configuration of the channel.
    fn reset_configuration(&mut self, now: Instant, events: &mut impl EventSink) {
        self.set_remote_sense(false, events);
        self.set_remote_programming(false, now, events);
        self.clear_protection(events);
        self.update_regulation_mode(false, false);

        self.flags.tracking = false;
        self.flags.calibrating = false;
        self.flags.dac_testing = false;
        self.status.set_oper_bit(OperBit::Calibrating, false);

        if self.dual_range() {
            self.range.reset();
            self.driver.set_current_range(CurrentRange::High);
        }

        self.settings.reset_protection(&self.params);
        *self.settings.current_range_selection = CurrentRangeSelectionMode::UseBoth;
        *self.settings.auto_range = true;
        *self.settings.calibration_enabled = self.calibration.any_exists();
        self.settings_dirty = true;

        self.u.reset();
        self.i.reset();
        self.p_limit = self.params.p_total;

        self.apply_voltage(self.u.set());
        self.apply_current(self.i.set(), now);
    }

    /// Get a snapshot of the channel state.
    pub fn status(&self, state: sm::States) -> ChannelStatus {
        let voltage = self.u.monitor.value();
        let current = self.i.monitor.value();

        ChannelStatus {
            voltage,
            current,
            power: round_prec(voltage * current, self.params.p_resolution),
            voltage_set: self.u.set(),
            current_set: self.i.set(),
            output_enabled: self.flags.output_enabled,
            current_range: self.range.range(),
            ovp: self.protection(ProtectionKind::OverVoltage),
            ocp: self.protection(ProtectionKind::OverCurrent),
            opp: self.protection(ProtectionKind::OverPower),
            questionable: self.status.questionable(),
            operation: self.status.operation(),
            state,
        }
    }
}

pub mod sm {
    use smlang::statemachine;

    impl Copy for States {}
    impl Clone for States {
        fn clone(&self) -> States {
            *self
        }
    }

    impl serde::Serialize for States {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            let (idx, var) = match self {
                States::Uninstalled => (0, "Uninstalled"),
                States::Installed => (1, "Installed"),
                States::Testing => (2, "Testing"),
                States::Operational => (3, "Operational"),
                States::Failed => (4, "Failed"),
                States::PoweredDown => (5, "PoweredDown"),
            };
            serializer.serialize_unit_variant("State", idx, var)
        }
    }

    statemachine! {
        transitions: {
            *Uninstalled + Install = Installed,

            Installed + StartTest = Testing,
            Installed + PowerDown = PoweredDown,

            Testing + TestPassed = Operational,
            Testing + TestFailed = Failed,
            Testing + PowerDown = PoweredDown,

            Operational + StartTest = Testing,
            Operational + Reset = Operational,
            Operational + PowerDown = PoweredDown,

            Failed + StartTest = Testing,
            Failed + PowerDown = PoweredDown,

            PoweredDown + PowerUp = Installed,
        }
    }
}

impl<D: ChannelDriver> sm::StateMachineContext for PsuChannel<D> {}

pub type PsuChannelMachine<D> = sm::StateMachine<PsuChannel<D>>;

impl<D: ChannelDriver> sm::StateMachine<PsuChannel<D>> {
    /// Register the channel as present.
    ///
    /// # Args
    /// * `slot` - The physical slot of the channel module.
    /// * `subchannel` - The index of the channel within its module.
    pub fn install(&mut self, slot: u8, subchannel: u8) {
        if self.process_event(sm::Events::Install).is_ok() {
            let channel = self.context_mut();
            channel.slot = slot;
            channel.subchannel = subchannel;
            info!(
                "{}: Installed in slot {} (sub-channel {})",
                channel.channel, slot, subchannel
            );
        }
    }

    /// Prepare an installed channel for use.
    ///
    /// # Note
    /// Stored settings and calibration data are loaded. Stored settings that do not fit the
    /// channel module are discarded.
    pub fn init(&mut self, persistence: &mut impl Persistence, now: Instant) {
        if matches!(self.state(), &sm::States::Uninstalled) {
            return;
        }

        let channel = self.context_mut();
        let id = channel.channel;

        if let Some(calibration) = persistence.load_calibration(id) {
            channel.calibration = calibration;
        }

        if let Some(settings) = persistence.load_settings(id) {
            match settings.check_bounds(&channel.params) {
                Ok(()) => {
                    channel.settings = settings;
                    if channel.calibration_enabled() && !channel.calibration.any_exists() {
                        *channel.settings.calibration_enabled = false;
                    }
                }
                Err(error) => warn!("{}: Discarding stored settings: {:?}", id, error),
            }
        }

        channel.driver.init();
        channel.reapply_setpoints(now);
    }

    /// Run the channel self-test.
    ///
    /// # Note
    /// The output is expected to be disabled by the caller.
    pub fn test(&mut self, now: Instant, events: &mut impl EventSink) -> TestResult {
        if self.process_event(sm::Events::StartTest).is_err() {
            return self.context().driver.test_result();
        }

        let channel = self.context_mut();
        channel.set_remote_sense(false, events);
        channel.set_remote_programming(false, now, events);

        let result = channel.driver.test();
        let event = match result {
            TestResult::Passed => {
                info!("{}: Self-test passed", channel.channel);
                sm::Events::TestPassed
            }
            _ => {
                warn!("{}: Self-test failed", channel.channel);
                sm::Events::TestFailed
            }
        };

        self.process_event(event).ok();
        result
    }

    /// Restore the default configuration of an operational channel.
    pub fn reset(&mut self, now: Instant, events: &mut impl EventSink) {
        if self.process_event(sm::Events::Reset).is_ok() {
            self.context_mut().reset_configuration(now, events);
        }
    }

    /// Power the channel down.
    ///
    /// # Note
    /// The output is expected to be disabled by the caller.
    pub fn power_down(&mut self, now: Instant, events: &mut impl EventSink) {
        if self.process_event(sm::Events::PowerDown).is_ok() {
            let channel = self.context_mut();
            channel.set_remote_sense(false, events);
            channel.set_remote_programming(false, now, events);
            channel.clear_protection(events);
            info!("{}: Powered down", channel.channel);
        }
    }

    /// Power a powered-down channel back up. The channel must pass its self-test again.
    pub fn power_up(&mut self) {
        if self.process_event(sm::Events::PowerUp).is_ok() {
            info!("{}: Powered up", self.context().channel);
        }
    }

    /// Check if the channel can be used.
    pub fn is_ok(&self) -> bool {
        matches!(self.state(), &sm::States::Operational) && self.context().driver.is_power_ok()
    }

    pub fn is_installed(&self) -> bool {
        !matches!(self.state(), &sm::States::Uninstalled)
    }

    /// Get a snapshot of the channel state.
    pub fn status(&self) -> ChannelStatus {
        self.context().status(*self.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        calibration::{CalibrationPoint, CalibrationValue},
        testing::{code, MockBoard, MockDriver, Record, Timeline, PARAMS},
    };

    fn at_ms(ms: u64) -> Instant {
        Instant::from_ticks(ms * 1000)
    }

    fn channel(timeline: &Timeline) -> PsuChannel<MockDriver> {
        PsuChannel::new(Channel::Zero, PARAMS, MockDriver::new(Channel::Zero, timeline))
    }

    fn enable(psu: &mut PsuChannel<MockDriver>) {
        psu.request_output(true);
        psu.finish_sync(true, true);
    }

    fn range_changes(timeline: &Timeline) -> Vec<CurrentRange> {
        timeline
            .borrow()
            .iter()
            .filter_map(|record| match record {
                Record::CurrentRange(_, range) => Some(*range),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn setpoints_hold_invariant() {
        let timeline = Timeline::default();
        let mut psu = channel(&timeline);
        let now = at_ms(0);

        let check = |psu: &PsuChannel<MockDriver>| {
            assert!(psu.voltage().is_consistent());
            assert!(psu.current().is_consistent());
        };

        psu.set_voltage(50.0);
        assert_eq!(psu.voltage().set(), PARAMS.u_max);
        check(&psu);

        psu.set_voltage_limit(10.0);
        assert_eq!(psu.voltage().set(), 10.0);
        check(&psu);

        psu.set_voltage(-5.0);
        assert_eq!(psu.voltage().set(), 0.0);
        check(&psu);

        psu.set_voltage_limit(60.0);
        assert_eq!(psu.voltage().limit(), PARAMS.u_max);
        check(&psu);

        psu.set_current(7.0, now);
        assert_eq!(psu.current().set(), PARAMS.i_max);
        check(&psu);

        psu.set_current_limit(1.0, now);
        assert_eq!(psu.current().set(), 1.0);
        check(&psu);

        psu.set_current_limit(-1.0, now);
        assert_eq!(psu.current().set(), 0.0);
        check(&psu);
    }

    #[test]
    fn voltage_raises_protection_level() {
        let timeline = Timeline::default();
        let mut board = MockBoard::new(&timeline);
        let mut psu = channel(&timeline);

        let mut settings = *psu.settings();
        *settings.ovp_level = 10.0;
        psu.apply_settings(&settings, at_ms(0), &mut board);
        psu.take_settings_dirty();

        psu.set_voltage(12.0);
        assert_eq!(*psu.settings().ovp_level, 12.0);
        assert!(psu.take_settings_dirty());
    }

    #[test]
    fn power_limit_reduces_current() {
        let timeline = Timeline::default();
        let mut psu = channel(&timeline);

        psu.set_voltage(20.0);
        psu.set_current(5.0, at_ms(0));
        psu.set_power_limit(50.0, at_ms(0));

        assert_eq!(psu.power_limit(), 50.0);
        assert!((psu.current().set() - 2.5).abs() < 1e-4);

        psu.set_power_limit(500.0, at_ms(0));
        assert_eq!(psu.power_limit(), PARAMS.p_total);
    }

    #[test]
    fn low_range_only_caps_current() {
        let timeline = Timeline::default();
        let mut board = MockBoard::new(&timeline);
        let mut psu = channel(&timeline);
        psu.set_current(1.0, at_ms(0));

        let mut settings = *psu.settings();
        *settings.current_range_selection = CurrentRangeSelectionMode::AlwaysLow;
        psu.apply_settings(&settings, at_ms(0), &mut board);

        assert_eq!(psu.current().limit(), PARAMS.i_low_max);
        assert_eq!(psu.current().set(), PARAMS.i_low_max);
        assert_eq!(psu.current_range(), CurrentRange::Low);

        psu.set_current(3.0, at_ms(1));
        assert_eq!(psu.current().set(), PARAMS.i_low_max);
    }

    #[test]
    fn auto_range_follows_measured_current() {
        let timeline = Timeline::default();
        let mut psu = channel(&timeline);
        psu.set_current(1.0, at_ms(0));
        assert_eq!(psu.current_range(), CurrentRange::High);
        enable(&mut psu);
        timeline.borrow_mut().clear();

        psu.tick(at_ms(0), false);
        psu.on_adc_data(
            AdcDataType::CurrentMonitor,
            code(0.01, PARAMS.i_max),
            false,
        );
        psu.tick(at_ms(3), false);
        assert!(range_changes(&timeline).is_empty());

        psu.tick(at_ms(6), false);
        assert_eq!(psu.current_range(), CurrentRange::Low);
        assert_eq!(range_changes(&timeline), [CurrentRange::Low]);
        assert_eq!(
            timeline.borrow().last(),
            Some(&Record::DacCurrent(Channel::Zero, PARAMS.dac_max))
        );

        // Regulating in constant current above the low range moves back up.
        psu.driver_mut().cc = true;
        psu.tick(at_ms(8), false);
        assert_eq!(psu.current_range(), CurrentRange::Low);
        psu.tick(at_ms(12), false);
        assert_eq!(psu.current_range(), CurrentRange::High);
    }

    #[test]
    fn crossings_within_delay_change_range_once() {
        let timeline = Timeline::default();
        let mut psu = channel(&timeline);
        psu.set_current(1.0, at_ms(0));
        enable(&mut psu);
        psu.tick(at_ms(0), false);
        timeline.borrow_mut().clear();

        psu.set_current(0.01, at_ms(1));
        psu.set_current(1.0, at_ms(2));
        assert!(range_changes(&timeline).is_empty());

        psu.set_current(0.01, at_ms(3));
        psu.tick(at_ms(4), false);
        psu.tick(at_ms(6), false);
        assert_eq!(range_changes(&timeline), [CurrentRange::Low]);
    }

    #[test]
    fn regulation_mode_is_reported() {
        let timeline = Timeline::default();
        let mut psu = channel(&timeline);
        enable(&mut psu);

        psu.driver_mut().cc = true;
        psu.tick(at_ms(0), false);
        assert!(psu.is_cc_mode());
        assert!(psu.status_registers().oper_bit(OperBit::ConstantCurrent));
        assert!(psu.status_registers().ques_bit(QuesBit::Voltage));

        psu.driver_mut().cc = false;
        psu.driver_mut().cv = true;
        psu.tick(at_ms(1), false);
        assert!(!psu.status_registers().oper_bit(OperBit::ConstantCurrent));
        assert!(psu.status_registers().oper_bit(OperBit::ConstantVoltage));

        psu.request_output(false);
        psu.finish_sync(false, false);
        assert!(!psu.is_cv_mode());
        assert!(psu.status_registers().oper_bit(OperBit::OutputOff));
    }

    #[test]
    fn calibration_enable_requires_data() {
        let timeline = Timeline::default();
        let mut board = MockBoard::new(&timeline);
        let mut psu = channel(&timeline);

        psu.set_calibration_enabled(true, at_ms(0), &mut board);
        assert!(!*psu.settings().calibration_enabled);

        let mut calibration = psu.calibration().clone();
        calibration.voltage = CalibrationValue::from_points(&[
            CalibrationPoint::new(0.0, 0.0, 0.0),
            CalibrationPoint::new(65535.0, 20.0, 65535.0),
        ])
        .unwrap();
        psu.set_calibration(calibration, at_ms(0));

        psu.set_calibration_enabled(true, at_ms(0), &mut board);
        assert!(*psu.settings().calibration_enabled);
        assert_eq!(psu.voltage().limit(), 20.0);

        psu.set_voltage(10.0);
        assert_eq!(
            timeline.borrow().last(),
            Some(&Record::DacVoltage(Channel::Zero, 32768))
        );
        assert!(timeline
            .borrow()
            .contains(&Record::Event(Event::CalibrationEnabled(Channel::Zero))));
    }

    #[test]
    fn lifecycle() {
        let timeline = Timeline::default();
        let mut board = MockBoard::new(&timeline);
        let mut machine = PsuChannelMachine::new(channel(&timeline));

        assert_eq!(machine.test(at_ms(0), &mut board), TestResult::NotTested);
        assert!(!machine.is_installed());

        machine.install(2, 1);
        assert_eq!(machine.context().location(), (2, 1));
        machine.init(&mut board, at_ms(0));
        assert!(!machine.is_ok());

        assert_eq!(machine.test(at_ms(0), &mut board), TestResult::Passed);
        assert!(machine.is_ok());

        machine.context_mut().driver_mut().power_ok = false;
        assert!(!machine.is_ok());
        machine.context_mut().driver_mut().power_ok = true;

        machine.power_down(at_ms(0), &mut board);
        assert!(matches!(machine.state(), &sm::States::PoweredDown));
        machine.reset(at_ms(0), &mut board);
        assert!(matches!(machine.state(), &sm::States::PoweredDown));

        machine.power_up();
        assert!(!machine.is_ok());
        machine.test(at_ms(0), &mut board);
        assert!(machine.is_ok());
    }
}
