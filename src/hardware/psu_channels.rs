//! PSU channel management control interface definitions.

use enum_iterator::all;
use heapless::spsc::Consumer;
use serde::{Deserialize, Serialize};

use super::{
    inhibit::InhibitInput,
    output_sync::OutputEnableSynchronizer,
    protection::ProtectionKind,
    psu_channel::{ChannelStatus, PsuChannel, PsuChannelMachine},
    AdcDataType, Board, BoardParameters, Channel, ChannelDriver, ChannelMask, Features, Instant,
    TestResult, MAX_CHANNELS,
};
use crate::{
    calibration::CalibrationConfiguration,
    command::{Command, COMMAND_QUEUE_DEPTH},
    events::Event,
    settings::ChannelSettings,
    Error,
};

/// How the first two channels are wired together.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CouplingType {
    None,
    Parallel,
    Series,
}

/// Represents a control structure for all PSU output channels.
pub struct PsuChannels<D: ChannelDriver, B: Board> {
    channels: [Option<PsuChannelMachine<D>>; MAX_CHANNELS],
    board: B,
    sync: OutputEnableSynchronizer,
    inhibit: InhibitInput,
    coupling: CouplingType,
    tracking: ChannelMask,
}

impl<D: ChannelDriver, B: Board> PsuChannels<D, B> {
    /// Construct an empty channel registry.
    ///
    /// # Args
    /// * `board` - The surrounding firmware.
    pub fn new(board: B) -> Self {
        Self {
            channels: core::array::from_fn(|_| None),
            board,
            sync: OutputEnableSynchronizer::new(),
            inhibit: InhibitInput::new(),
            coupling: CouplingType::None,
            tracking: ChannelMask::empty(),
        }
    }

    /// Register a channel that was discovered on the hardware.
    ///
    /// # Args
    /// * `channel` - The index of the channel.
    /// * `params` - The description of the channel module.
    /// * `driver` - Access to the channel's analog front end.
    /// * `slot` - The physical slot of the channel module.
    /// * `subchannel` - The index of the channel within its module.
    pub fn install(
        &mut self,
        channel: Channel,
        params: BoardParameters,
        driver: D,
        slot: u8,
        subchannel: u8,
    ) {
        let mut machine = PsuChannelMachine::new(PsuChannel::new(channel, params, driver));
        machine.install(slot, subchannel);
        self.channels[channel as usize].replace(machine);
    }

    /// Load stored configuration of all installed channels.
    pub fn init(&mut self) {
        let now = self.board.now();
        let Self {
            channels, board, ..
        } = self;

        for machine in channels.iter_mut().flatten() {
            machine.init(board, now);
        }
    }

    /// Bring up all installed channels.
    ///
    /// # Note
    /// Every channel is initialized and self-tested. Output disable events are reported from
    /// here on.
    pub fn boot(&mut self) {
        self.init();

        for channel in all::<Channel>() {
            self.test(channel).ok();
        }

        self.sync.set_booted();
        info!("Boot complete");
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn channel(&self, channel: Channel) -> Option<&PsuChannelMachine<D>> {
        self.channels[channel as usize].as_ref()
    }

    pub fn channel_mut(&mut self, channel: Channel) -> Option<&mut PsuChannelMachine<D>> {
        self.channels[channel as usize].as_mut()
    }

    fn present(&self, channel: Channel) -> Result<&PsuChannelMachine<D>, Error> {
        self.channel(channel).ok_or(Error::NotPresent)
    }

    /// Check if a channel is installed and healthy.
    pub fn is_ok(&self, channel: Channel) -> bool {
        self.channel(channel).map_or(false, |machine| machine.is_ok())
    }

    pub fn is_inhibited(&self) -> bool {
        self.inhibit.is_inhibited()
    }

    pub fn coupling(&self) -> CouplingType {
        self.coupling
    }

    pub fn tracking(&self) -> ChannelMask {
        self.tracking
    }

    pub fn status(&self, channel: Channel) -> Result<ChannelStatus, Error> {
        Ok(self.present(channel)?.status())
    }

    /// Get the channels whose outputs switch together with a channel.
    fn output_group(&self, channel: Channel) -> ChannelMask {
        let coupled: ChannelMask = [Channel::Zero, Channel::One].into_iter().collect();

        if self.coupling != CouplingType::None && coupled.contains(channel) {
            coupled
        } else if self.tracking.contains(channel) {
            self.tracking
        } else {
            channel.into()
        }
    }

    /// Get the channels a setpoint change of a channel applies to.
    fn setpoint_group(&self, channel: Channel) -> ChannelMask {
        if self.tracking.contains(channel) {
            self.tracking
        } else {
            channel.into()
        }
    }

    /// Commit all pending output state changes.
    fn synchronize(&mut self) {
        let Self {
            channels,
            board,
            sync,
            inhibit,
            ..
        } = self;
        sync.execute(channels, board, inhibit.is_inhibited());
    }

    fn disable_outputs(&mut self, mask: ChannelMask) {
        for channel in mask.iter() {
            if let Some(machine) = self.channels[channel as usize].as_mut() {
                machine.context_mut().request_output(false);
            }
        }
        self.synchronize();
    }

    /// Apply an operation to every healthy channel of a setpoint group.
    ///
    /// # Note
    /// Channels that are not ready are skipped. Changed settings are handed to persistence.
    fn update_group(
        &mut self,
        channel: Channel,
        mut f: impl FnMut(&mut PsuChannel<D>, Instant, &mut B),
    ) -> Result<(), Error> {
        self.present(channel)?;

        let group = self.setpoint_group(channel);
        let now = self.board.now();
        let Self {
            channels, board, ..
        } = self;

        for id in group.iter() {
            let Some(machine) = channels[id as usize].as_mut() else {
                continue;
            };

            if !machine.is_ok() {
                warn!("{}: Channel not ready", id);
                continue;
            }

            let psu = machine.context_mut();
            f(psu, now, board);
            if psu.take_settings_dirty() {
                board.save(id, psu.settings());
            }
        }

        Ok(())
    }

    pub fn set_voltage(&mut self, channel: Channel, voltage: f32) -> Result<(), Error> {
        self.update_group(channel, |psu, _, _| psu.set_voltage(voltage))
    }

    pub fn set_current(&mut self, channel: Channel, current: f32) -> Result<(), Error> {
        self.update_group(channel, |psu, now, _| psu.set_current(current, now))
    }

    pub fn set_voltage_limit(&mut self, channel: Channel, limit: f32) -> Result<(), Error> {
        self.update_group(channel, |psu, _, _| psu.set_voltage_limit(limit))
    }

    pub fn set_current_limit(&mut self, channel: Channel, limit: f32) -> Result<(), Error> {
        self.update_group(channel, |psu, now, _| psu.set_current_limit(limit, now))
    }

    pub fn set_power_limit(&mut self, channel: Channel, limit: f32) -> Result<(), Error> {
        self.update_group(channel, |psu, now, _| psu.set_power_limit(limit, now))
    }

    pub fn set_remote_sense(&mut self, channel: Channel, enable: bool) -> Result<(), Error> {
        self.update_group(channel, |psu, _, board| psu.set_remote_sense(enable, board))
    }

    pub fn set_remote_programming(&mut self, channel: Channel, enable: bool) -> Result<(), Error> {
        self.update_group(channel, |psu, now, board| {
            psu.set_remote_programming(enable, now, board)
        })
    }

    pub fn set_calibration_enabled(&mut self, channel: Channel, enable: bool) -> Result<(), Error> {
        self.update_group(channel, |psu, now, board| {
            psu.set_calibration_enabled(enable, now, board)
        })
    }

    /// Replace the calibration data of a channel, e.g. at the end of a calibration procedure.
    pub fn set_calibration(
        &mut self,
        channel: Channel,
        calibration: CalibrationConfiguration,
    ) -> Result<(), Error> {
        let now = self.board.now();
        let machine = self.channels[channel as usize]
            .as_mut()
            .ok_or(Error::NotPresent)?;
        let psu = machine.context_mut();
        psu.set_calibration(calibration, now);
        if psu.take_settings_dirty() {
            self.board.save(channel, psu.settings());
        }
        Ok(())
    }

    /// Change the output state of a channel and every channel switching together with it.
    ///
    /// # Note
    /// Enabling is refused if any channel of the group is not ready or has a latched protection.
    pub fn output_enable(&mut self, channel: Channel, enable: bool) -> Result<(), Error> {
        self.present(channel)?;
        let group = self.output_group(channel);

        if enable {
            for id in group.iter() {
                let ready = self
                    .channel(id)
                    .map_or(false, |machine| machine.is_ok() && !machine.context().is_tripped());
                if !ready {
                    warn!("{}: Output enable refused, {} is not ready", channel, id);
                    return Ok(());
                }
            }
        }

        for id in group.iter() {
            if let Some(machine) = self.channels[id as usize].as_mut() {
                machine.context_mut().request_output(enable);
            }
        }

        self.synchronize();
        Ok(())
    }

    pub fn disable_output_for_all_channels(&mut self) {
        self.disable_outputs(ChannelMask::all());
    }

    /// Clear latched protections of a channel.
    pub fn clear_protection(&mut self, channel: Channel) -> Result<(), Error> {
        let machine = self.channels[channel as usize]
            .as_mut()
            .ok_or(Error::NotPresent)?;
        machine.context_mut().clear_protection(&mut self.board);
        info!("{}: Protection cleared", channel);
        Ok(())
    }

    pub fn disable_protection(&mut self, channel: Channel) -> Result<(), Error> {
        self.update_group(channel, |psu, _, _| psu.disable_protection())
    }

    /// Apply new user configuration to a channel.
    ///
    /// # Note
    /// Settings are validated against the channel module first. Identical settings are ignored.
    pub fn handle_settings(
        &mut self,
        channel: Channel,
        settings: &ChannelSettings,
    ) -> Result<(), Error> {
        let machine = self.present(channel)?;
        settings.check_bounds(machine.context().params())?;

        if machine.context().settings() == settings {
            return Ok(());
        }

        let now = self.board.now();
        let machine = self.channels[channel as usize]
            .as_mut()
            .ok_or(Error::NotPresent)?;

        if !machine.is_ok() {
            warn!("{}: Channel not ready", channel);
            return Ok(());
        }

        let psu = machine.context_mut();
        psu.apply_settings(settings, now, &mut self.board);
        if psu.take_settings_dirty() {
            self.board.save(channel, psu.settings());
        }

        Ok(())
    }

    /// Configure the set of channels that are commanded as a unit.
    ///
    /// # Note
    /// Outputs of all channels entering or leaving tracking are disabled. Setpoints of the
    /// tracking channels are aligned to the lowest of them.
    pub fn set_tracking(&mut self, mask: ChannelMask) -> Result<(), Error> {
        if mask.iter().count() == 1 {
            return Err(Error::Invalid);
        }

        for channel in mask.iter() {
            if !self.is_ok(channel) {
                return Err(Error::NotPresent);
            }

            if self.coupling != CouplingType::None
                && matches!(channel, Channel::Zero | Channel::One)
            {
                return Err(Error::Invalid);
            }
        }

        let mut affected = self.tracking;
        for channel in mask.iter() {
            affected.insert(channel);
        }
        self.disable_outputs(affected);

        let mut voltage = f32::MAX;
        let mut current = f32::MAX;
        for channel in all::<Channel>() {
            if let Some(machine) = self.channels[channel as usize].as_mut() {
                let psu = machine.context_mut();
                psu.set_tracking(mask.contains(channel));
                if mask.contains(channel) {
                    voltage = voltage.min(psu.voltage().set());
                    current = current.min(psu.current().set());
                }
            }
        }

        self.tracking = mask;

        if let Some(first) = mask.iter().next() {
            info!("Tracking channels {:?}", mask);
            self.set_voltage(first, voltage)?;
            self.set_current(first, current)?;
        }

        Ok(())
    }

    /// Configure how the first two channels are wired together.
    pub fn set_coupling(&mut self, coupling: CouplingType) -> Result<(), Error> {
        let coupled: ChannelMask = [Channel::Zero, Channel::One].into_iter().collect();

        if coupling != CouplingType::None {
            for channel in coupled.iter() {
                let machine = self.present(channel)?;
                if !machine.context().params().has(Features::COUPLING) {
                    return Err(Error::Invalid);
                }
            }
        }

        self.disable_outputs(coupled);

        for channel in coupled.iter() {
            self.tracking.remove(channel);
        }
        if self.tracking.iter().count() < 2 {
            self.tracking = ChannelMask::empty();
        }
        for channel in all::<Channel>() {
            if let Some(machine) = self.channels[channel as usize].as_mut() {
                machine
                    .context_mut()
                    .set_tracking(self.tracking.contains(channel));
            }
        }

        self.coupling = coupling;
        info!("Coupling {:?}", coupling);
        self.update_all_channels();
        Ok(())
    }

    /// Handle a conversion result of a channel's ADC.
    ///
    /// # Note
    /// Protections of the channel are evaluated after every sample. A trip disables the output
    /// before this returns.
    ///
    /// # Returns
    /// The quantity to convert next.
    pub fn on_adc_data(
        &mut self,
        channel: Channel,
        kind: AdcDataType,
        raw: u16,
    ) -> Result<AdcDataType, Error> {
        let now = self.board.now();
        let inhibited = self.inhibit.is_inhibited();
        let machine = self.channels[channel as usize]
            .as_mut()
            .ok_or(Error::NotPresent)?;

        let next = machine.context_mut().on_adc_data(kind, raw, inhibited);

        if machine.is_ok() {
            if let Some(kind) = machine.context_mut().check_protection(now) {
                self.enter_protection(channel, kind, now);
            }
        }

        Ok(next)
    }

    fn enter_protection(&mut self, channel: Channel, kind: ProtectionKind, now: Instant) {
        self.disable_outputs(self.output_group(channel));

        if let Some(machine) = self.channels[channel as usize].as_mut() {
            let psu = machine.context_mut();
            psu.on_protection_tripped(kind, now, &mut self.board);
            if psu.take_settings_dirty() {
                self.board.save(channel, psu.settings());
            }
        }
    }

    /// Start conversions of all monitored quantities of every healthy channel.
    pub fn measure_all(&mut self) {
        for machine in self.channels.iter_mut().flatten() {
            if machine.is_ok() {
                machine.context_mut().measure_all();
            }
        }
    }

    /// Periodic service of all channels.
    ///
    /// # Args
    /// * `inhibit_asserted` - The raw level of the external inhibit input.
    pub fn tick(&mut self, inhibit_asserted: bool) {
        let now = self.board.now();

        if let Some(inhibited) = self.inhibit.update(inhibit_asserted) {
            if inhibited {
                warn!("Outputs inhibited");
            } else {
                info!("Inhibit released");
            }

            let Self {
                channels,
                board,
                sync,
                ..
            } = self;
            sync.refresh(channels, board, inhibited);
        }

        let inhibited = self.inhibit.is_inhibited();
        let mut reversed = ChannelMask::empty();
        for machine in self.channels.iter_mut().flatten() {
            if machine.is_installed() && machine.context_mut().tick(now, inhibited) {
                reversed.insert(machine.context().channel());
            }
        }

        for channel in reversed.iter() {
            warn!("{}: Reverse polarity detected", channel);
            self.disable_outputs(self.output_group(channel));
            self.board.push_event(Event::ReversePolarityDetected(channel));
        }
    }

    /// Run the self-test of a channel.
    ///
    /// # Note
    /// Outputs switching together with the channel are disabled first.
    pub fn test(&mut self, channel: Channel) -> Result<TestResult, Error> {
        self.present(channel)?;
        self.disable_outputs(self.output_group(channel));

        let now = self.board.now();
        let machine = self.channels[channel as usize]
            .as_mut()
            .ok_or(Error::NotPresent)?;
        Ok(machine.test(now, &mut self.board))
    }

    /// Restore the default configuration of a channel.
    pub fn reset(&mut self, channel: Channel) -> Result<(), Error> {
        self.present(channel)?;
        self.disable_outputs(self.output_group(channel));

        let now = self.board.now();
        let machine = self.channels[channel as usize]
            .as_mut()
            .ok_or(Error::NotPresent)?;
        machine.reset(now, &mut self.board);

        let psu = machine.context_mut();
        if psu.take_settings_dirty() {
            self.board.save(channel, psu.settings());
        }
        info!("{}: Reset", channel);
        Ok(())
    }

    /// Power down all channels.
    pub fn power_down(&mut self) {
        self.disable_output_for_all_channels();

        let now = self.board.now();
        let Self {
            channels, board, ..
        } = self;
        for machine in channels.iter_mut().flatten() {
            machine.power_down(now, board);
        }
    }

    /// Power up all channels and run their self-tests.
    pub fn power_up(&mut self) {
        for machine in self.channels.iter_mut().flatten() {
            machine.power_up();
        }

        for channel in all::<Channel>() {
            self.test(channel).ok();
        }
    }

    /// Remember which outputs are enabled and disable all of them.
    pub fn save_and_disable_all(&mut self) {
        let Self {
            channels,
            board,
            sync,
            inhibit,
            ..
        } = self;
        sync.save_and_disable_all(channels, board, inhibit.is_inhibited());
    }

    /// Re-enable the outputs disabled by [PsuChannels::save_and_disable_all].
    pub fn restore(&mut self) {
        let Self {
            channels,
            board,
            sync,
            inhibit,
            ..
        } = self;
        sync.restore(channels, board, inhibit.is_inhibited());
    }

    /// Push fresh setpoints and the output state of all channels to the hardware, e.g. after
    /// calibration or coupling changed.
    ///
    /// # Note
    /// No events are reported.
    pub fn update_all_channels(&mut self) {
        let now = self.board.now();
        for machine in self.channels.iter_mut().flatten() {
            if machine.is_ok() {
                machine.context_mut().reapply_setpoints(now);
            }
        }

        let Self {
            channels,
            board,
            sync,
            inhibit,
            ..
        } = self;
        sync.refresh(channels, board, inhibit.is_inhibited());

        for machine in channels.iter_mut().flatten() {
            if machine.is_ok() {
                let psu = machine.context_mut();
                psu.reapply_modes();
                if psu.take_settings_dirty() {
                    board.save(psu.channel(), psu.settings());
                }
            }
        }
    }

    /// Execute a single command.
    pub fn handle_command(&mut self, command: Command) -> Result<(), Error> {
        match command {
            Command::SetVoltage(channel, value) => self.set_voltage(channel, value),
            Command::SetCurrent(channel, value) => self.set_current(channel, value),
            Command::SetVoltageLimit(channel, value) => self.set_voltage_limit(channel, value),
            Command::SetCurrentLimit(channel, value) => self.set_current_limit(channel, value),
            Command::SetPowerLimit(channel, value) => self.set_power_limit(channel, value),
            Command::OutputEnable(channel, enable) => self.output_enable(channel, enable),
            Command::DisableOutputForAllChannels => {
                self.disable_output_for_all_channels();
                Ok(())
            }
            Command::RemoteSense(channel, enable) => self.set_remote_sense(channel, enable),
            Command::RemoteProgramming(channel, enable) => {
                self.set_remote_programming(channel, enable)
            }
            Command::CalibrationEnable(channel, enable) => {
                self.set_calibration_enabled(channel, enable)
            }
            Command::ClearProtection(channel) => self.clear_protection(channel),
            Command::DisableProtection(channel) => self.disable_protection(channel),
            Command::Settings(channel, settings) => self.handle_settings(channel, &settings),
            Command::Tracking(mask) => self.set_tracking(mask),
            Command::Coupling(coupling) => self.set_coupling(coupling),
            Command::Test(channel) => self.test(channel).map(|_| ()),
            Command::Reset(channel) => self.reset(channel),
            Command::PowerDown => {
                self.power_down();
                Ok(())
            }
            Command::PowerUp => {
                self.power_up();
                Ok(())
            }
            Command::SaveAndDisableAll => {
                self.save_and_disable_all();
                Ok(())
            }
            Command::Restore => {
                self.restore();
                Ok(())
            }
            Command::UpdateAllChannels => {
                self.update_all_channels();
                Ok(())
            }
        }
    }

    /// Execute all queued commands.
    pub fn process(&mut self, commands: &mut Consumer<'_, Command, COMMAND_QUEUE_DEPTH>) {
        while let Some(command) = commands.dequeue() {
            if let Err(error) = self.handle_command(command) {
                warn!("Command {:?} failed: {:?}", command, error);
            }
        }
    }
}
