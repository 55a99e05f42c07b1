//! Regulation core of a multi-channel programmable power supply.
//!
//! # Note
//! The core owns the runtime state of every output channel: setpoints and limits, filtered
//! measurements, calibration, over-voltage/current/power protection, current range selection and
//! synchronized output switching. Hardware access, event reporting, persistence and timing are
//! supplied by the surrounding firmware through the traits in [hardware].
#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;

pub mod calibration;
pub mod command;
pub mod error;
pub mod events;
pub mod filter;
pub mod hardware;
pub mod linear_transformation;
pub mod regulated_value;
pub mod settings;
pub mod status;

#[cfg(test)]
mod testing;

pub use error::Error;
