//! Synchronized output enable transactions.
//!
//! # Note
//! Output state changes of all channels are collected and committed together. The shared
//! synchronization signal is held asserted while channels are reconfigured so that every affected
//! output switches on the same edge, and released once all channels have been finalized.
//!
//! A transaction is ordered as follows:
//! 1. Pre-sync: enabling channels prepare the output switch, disabling channels drop OVP, the DAC
//!    and the output switch.
//! 2. If any channel is enabling, the output switches settle and the DACs and current ranges of
//!    the enabling channels are loaded before a second commit. The DACs are then left to settle.
//! 3. Post-sync: enabling channels restore remote programming and restart conversions, disabling
//!    channels restore the current range and remote programming.
//! 4. Enabling channels arm OVP.
//! 5. All affected channels are finalized and their visible state updated.
use bitflags::bitflags;
use heapless::Vec;

use super::{
    platform,
    psu_channel::{PsuChannel, PsuChannelMachine},
    Board, ChannelDriver, ChannelMask, MAX_CHANNELS,
};
use crate::events::Event;

bitflags! {
    /// The parts of an output enable transition a channel driver is asked to perform.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OutputEnableTasks: u8 {
        const OE                    = 1<<0;
        const DAC                   = 1<<1;
        const CURRENT_RANGE         = 1<<2;
        const OVP                   = 1<<3;
        const REMOTE_PROGRAMMING    = 1<<4;
        const ADC_START             = 1<<5;
        const FINALIZE              = 1<<6;
    }
}

/// Boundaries of an output enable transaction signalled on the shared sync line.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncPhase {
    /// The sync line is asserted after the pre-sync tasks.
    Assert,
    /// Output switches of enabling channels settled and their DACs were loaded.
    PostSyncEnable,
    /// All channels were finalized.
    Finalize,
    /// The sync line is released.
    Release,
}

/// Coordinates output state changes across channels.
#[derive(Debug, Default)]
pub struct OutputEnableSynchronizer {
    booted: bool,
    saved: Option<ChannelMask>,
}

impl OutputEnableSynchronizer {
    pub const fn new() -> Self {
        Self {
            booted: false,
            saved: None,
        }
    }

    /// Indicate the boot sequence completed.
    ///
    /// # Note
    /// Output disable events are only reported after boot.
    pub fn set_booted(&mut self) {
        self.booted = true;
    }

    pub fn is_booted(&self) -> bool {
        self.booted
    }

    /// Commit all pending output state changes in a single transaction.
    ///
    /// # Args
    /// * `channels` - All channel slots.
    /// * `board` - The surrounding firmware.
    /// * `inhibited` - Whether the inhibit input currently holds all outputs off.
    pub fn execute<D: ChannelDriver, B: Board>(
        &self,
        channels: &mut [Option<PsuChannelMachine<D>>],
        board: &mut B,
        inhibited: bool,
    ) {
        // The visible target of each channel, and the hardware state it maps to.
        let mut plan: [Option<(bool, bool)>; MAX_CHANNELS] = [None; MAX_CHANNELS];

        for (slot, machine) in channels.iter_mut().enumerate().take(MAX_CHANNELS) {
            let Some(machine) = machine else {
                continue;
            };

            let Some(target) = machine.context().sync_request() else {
                continue;
            };

            // A faulty channel is never switched on. It is driven through the disable path
            // instead, so that its output ends up off.
            if target && !inhibited && !machine.is_ok() {
                warn!(
                    "{}: Refusing to enable output of a faulty channel",
                    machine.context().channel()
                );
                plan[slot] = Some((false, false));
                continue;
            }

            plan[slot] = Some((target, target && !inhibited));
        }

        if plan.iter().all(Option::is_none) {
            return;
        }

        debug!(
            "Output sync of {} channel(s)",
            plan.iter().flatten().count()
        );

        let enabling = |plan: &(bool, bool)| plan.1;

        Self::for_each(channels, &plan, |psu, step| {
            let tasks = if enabling(&step) {
                OutputEnableTasks::OE
            } else {
                OutputEnableTasks::OVP | OutputEnableTasks::DAC | OutputEnableTasks::OE
            };
            psu.commit_output(step.1, tasks);
        });

        board.commit(SyncPhase::Assert);

        if plan.iter().flatten().any(enabling) {
            board.delay_us(platform::OUTPUT_ENABLE_SETTLING_US);

            Self::for_each(channels, &plan, |psu, step| {
                if enabling(&step) {
                    psu.commit_output(
                        true,
                        OutputEnableTasks::DAC | OutputEnableTasks::CURRENT_RANGE,
                    );
                }
            });

            board.commit(SyncPhase::PostSyncEnable);
            board.delay_us(platform::DAC_SETTLING_US);
        }

        Self::for_each(channels, &plan, |psu, step| {
            let tasks = if enabling(&step) {
                OutputEnableTasks::REMOTE_PROGRAMMING | OutputEnableTasks::ADC_START
            } else {
                OutputEnableTasks::CURRENT_RANGE | OutputEnableTasks::REMOTE_PROGRAMMING
            };
            psu.commit_output(step.1, tasks);
        });

        Self::for_each(channels, &plan, |psu, step| {
            if enabling(&step) {
                psu.commit_output(true, OutputEnableTasks::OVP);
            }
        });

        // Visible state of every affected channel is updated before any event is reported.
        let mut events: Vec<Event, MAX_CHANNELS> = Vec::new();
        Self::for_each(channels, &plan, |psu, (target, hardware)| {
            psu.commit_output(hardware, OutputEnableTasks::FINALIZE);
            if let Some(event) = psu.finish_sync(target, hardware) {
                events.push(event).ok();
            }
        });

        board.commit(SyncPhase::Finalize);
        board.commit(SyncPhase::Release);

        for event in events {
            match event {
                Event::OutputEnabled(channel) => {
                    info!("{}: Output enabled", channel);
                    board.push_event(event);
                }
                Event::OutputDisabled(channel) => {
                    info!("{}: Output disabled", channel);
                    if self.booted {
                        board.push_event(event);
                    }
                }
                _ => board.push_event(event),
            }
        }
    }

    fn for_each<D: ChannelDriver>(
        channels: &mut [Option<PsuChannelMachine<D>>],
        plan: &[Option<(bool, bool)>; MAX_CHANNELS],
        mut f: impl FnMut(&mut PsuChannel<D>, (bool, bool)),
    ) {
        for (machine, step) in channels.iter_mut().zip(plan.iter()) {
            if let (Some(machine), Some(step)) = (machine, step) {
                f(machine.context_mut(), *step);
            }
        }
    }

    /// Re-apply the current output state of every channel to the hardware.
    ///
    /// # Note
    /// Visible state is unchanged, so no events are reported.
    pub fn refresh<D: ChannelDriver, B: Board>(
        &self,
        channels: &mut [Option<PsuChannelMachine<D>>],
        board: &mut B,
        inhibited: bool,
    ) {
        for machine in channels.iter_mut().flatten() {
            machine.context_mut().request_refresh();
        }

        self.execute(channels, board, inhibited);
    }

    /// Remember which outputs are enabled and disable all of them.
    ///
    /// # Note
    /// Does nothing if a snapshot is already held.
    pub fn save_and_disable_all<D: ChannelDriver, B: Board>(
        &mut self,
        channels: &mut [Option<PsuChannelMachine<D>>],
        board: &mut B,
        inhibited: bool,
    ) {
        if self.saved.is_some() {
            return;
        }

        let mut mask = ChannelMask::empty();
        for machine in channels.iter_mut().flatten() {
            let psu = machine.context_mut();
            if psu.is_output_enabled() {
                mask.insert(psu.channel());
                psu.request_output(false);
            }
        }

        debug!("Saved output state {:?}", mask);
        self.saved.replace(mask);
        self.execute(channels, board, inhibited);
    }

    /// Re-enable the outputs captured by [OutputEnableSynchronizer::save_and_disable_all].
    ///
    /// # Note
    /// Channels that are no longer healthy stay disabled.
    pub fn restore<D: ChannelDriver, B: Board>(
        &mut self,
        channels: &mut [Option<PsuChannelMachine<D>>],
        board: &mut B,
        inhibited: bool,
    ) {
        let Some(mask) = self.saved.take() else {
            return;
        };

        for machine in channels.iter_mut().flatten() {
            let channel = machine.context().channel();
            if mask.contains(channel) && machine.is_ok() {
                machine.context_mut().request_output(true);
            }
        }

        self.execute(channels, board, inhibited);
    }

    /// Get the channels captured by the current output snapshot.
    pub fn saved(&self) -> Option<ChannelMask> {
        self.saved
    }
}
