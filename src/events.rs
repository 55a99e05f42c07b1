//! Notifications emitted by the regulation core.

use crate::hardware::{protection::ProtectionKind, Channel};

/// A channel event reported to the user interface and event log.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize)]
pub enum Event {
    OutputEnabled(Channel),
    OutputDisabled(Channel),
    ProtectionTripped(Channel, ProtectionKind),
    RemoteSenseEnabled(Channel),
    RemoteSenseDisabled(Channel),
    RemoteProgrammingEnabled(Channel),
    RemoteProgrammingDisabled(Channel),
    /// Remote programming was forced off by an over-voltage trip at the maximum level.
    RemoteProgrammingAlarm(Channel),
    ReversePolarityDetected(Channel),
    CalibrationEnabled(Channel),
    CalibrationDisabled(Channel),
}

/// The consumer of channel events.
pub trait EventSink {
    /// Report an event. Delivery is fire-and-forget.
    fn push_event(&mut self, event: Event);

    /// Mark a previously reported event as read, if it is still unread.
    fn acknowledge(&mut self, event: Event);
}
