//! PSU channel settings

pub mod channel_settings;

pub use channel_settings::ChannelSettings;
