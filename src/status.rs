//! Per-channel condition registers of the status reporting subsystem.

use bit_field::BitField;

/// Bits of the questionable instrument summary register.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QuesBit {
    Voltage = 0,
    Current = 1,
    ReversePolarity = 7,
    OverVoltage = 8,
    OverCurrent = 9,
    OverPower = 10,
}

/// Bits of the operation instrument summary register.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OperBit {
    Calibrating = 0,
    ConstantVoltage = 8,
    ConstantCurrent = 9,
    OutputOff = 10,
    RemoteSense = 12,
    RemoteProgramming = 13,
}

/// Condition registers of one channel.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct StatusRegisters {
    questionable: u16,
    operation: u16,
}

impl StatusRegisters {
    pub fn set_ques_bit(&mut self, bit: QuesBit, value: bool) {
        self.questionable.set_bit(bit as usize, value);
    }

    pub fn set_oper_bit(&mut self, bit: OperBit, value: bool) {
        self.operation.set_bit(bit as usize, value);
    }

    pub fn ques_bit(&self, bit: QuesBit) -> bool {
        self.questionable.get_bit(bit as usize)
    }

    pub fn oper_bit(&self, bit: OperBit) -> bool {
        self.operation.get_bit(bit as usize)
    }

    /// The questionable condition register.
    pub fn questionable(&self) -> u16 {
        self.questionable
    }

    /// The operation condition register.
    pub fn operation(&self) -> u16 {
        self.operation
    }
}
