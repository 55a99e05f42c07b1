//! Requests posted to the regulation task.
//!
//! # Note
//! Only the regulation task mutates channel state. Other tasks enqueue a [Command] and return
//! immediately. The regulation task drains the queue with [crate::hardware::psu_channels::PsuChannels::process].

use heapless::spsc::{Producer, Queue};

use crate::{
    hardware::{psu_channels::CouplingType, Channel, ChannelMask},
    settings::ChannelSettings,
    Error,
};

/// The number of slots of the command queue. One slot is always kept free.
pub const COMMAND_QUEUE_DEPTH: usize = 16;

pub type CommandQueue = Queue<Command, COMMAND_QUEUE_DEPTH>;

/// A mutating request on the channel registry.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Command {
    SetVoltage(Channel, f32),
    SetCurrent(Channel, f32),
    SetVoltageLimit(Channel, f32),
    SetCurrentLimit(Channel, f32),
    SetPowerLimit(Channel, f32),
    OutputEnable(Channel, bool),
    DisableOutputForAllChannels,
    RemoteSense(Channel, bool),
    RemoteProgramming(Channel, bool),
    CalibrationEnable(Channel, bool),
    ClearProtection(Channel),
    DisableProtection(Channel),
    Settings(Channel, ChannelSettings),
    Tracking(ChannelMask),
    Coupling(CouplingType),
    Test(Channel),
    Reset(Channel),
    PowerDown,
    PowerUp,
    SaveAndDisableAll,
    Restore,
    UpdateAllChannels,
}

/// The producing end of the command queue, owned by a task other than the regulation task.
pub struct CommandSender<'a> {
    producer: Producer<'a, Command, COMMAND_QUEUE_DEPTH>,
}

impl<'a> CommandSender<'a> {
    pub fn new(producer: Producer<'a, Command, COMMAND_QUEUE_DEPTH>) -> Self {
        Self { producer }
    }

    /// Post a command to the regulation task.
    ///
    /// # Returns
    /// An error if the queue is full. The command is dropped in that case.
    pub fn send(&mut self, command: Command) -> Result<(), Error> {
        self.producer.enqueue(command).map_err(|command| {
            warn!("Command queue full, dropping {:?}", command);
            Error::QueueFull
        })
    }

    pub fn ready(&self) -> bool {
        self.producer.ready()
    }
}
