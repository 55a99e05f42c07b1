//! Error type definitions for the PSU regulation core.

/// An enumeration of possible errors with the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize)]
pub enum Error {
    /// A supplied configuration value is not acceptable.
    Invalid,
    /// The addressed channel is not installed.
    NotPresent,
    /// A value lies outside of what the hardware can represent.
    Bounds,
    /// The regulation command queue cannot accept more requests.
    QueueFull,
}
