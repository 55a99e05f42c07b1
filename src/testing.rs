//! Recording doubles of the hardware and firmware collaborators.
//!
//! Every driver and the board share one timeline so that the relative ordering of driver calls,
//! synchronization phases and events can be asserted.

use std::{cell::RefCell, rc::Rc, vec::Vec};

use embedded_hal::delay::DelayNs;

use crate::{
    calibration::CalibrationConfiguration,
    events::{Event, EventSink},
    hardware::{
        current_range::CurrentRange,
        output_sync::{OutputEnableTasks, SyncPhase},
        platform,
        psu_channels::PsuChannels,
        BoardParameters, Channel, ChannelDriver, Clock, Instant, Persistence, SyncCommit,
        TestResult, MAX_CHANNELS,
    },
    settings::ChannelSettings,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    DacVoltage(Channel, u16),
    DacCurrent(Channel, u16),
    OutputEnable(Channel, bool, OutputEnableTasks),
    RemoteSense(Channel, bool),
    RemoteProgramming(Channel, bool),
    CurrentRange(Channel, CurrentRange),
    Measure(Channel),
    Commit(SyncPhase),
    DelayUs(u32),
    Event(Event),
    Acknowledge(Event),
    Save(Channel),
}

pub type Timeline = Rc<RefCell<Vec<Record>>>;

/// DCP405 parameters without ground offsets, so that codes map to round values.
pub const PARAMS: BoardParameters = BoardParameters {
    voltage_ground_offset: 0.0,
    current_ground_offset: 0.0,
    ..platform::DCP405
};

/// Get the ADC code of a value for a converter spanning `full_scale`.
pub fn code(value: f32, full_scale: f32) -> u16 {
    libm::roundf(value / full_scale * 65535.0) as u16
}

pub struct MockDriver {
    channel: Channel,
    timeline: Timeline,
    pub result: TestResult,
    tested: TestResult,
    pub cv: bool,
    pub cc: bool,
    pub reverse_polarity: bool,
    pub power_ok: bool,
}

impl MockDriver {
    pub fn new(channel: Channel, timeline: &Timeline) -> Self {
        Self {
            channel,
            timeline: timeline.clone(),
            result: TestResult::Passed,
            tested: TestResult::NotTested,
            cv: false,
            cc: false,
            reverse_polarity: false,
            power_ok: true,
        }
    }

    fn record(&self, record: Record) {
        self.timeline.borrow_mut().push(record);
    }
}

impl ChannelDriver for MockDriver {
    fn test(&mut self) -> TestResult {
        self.tested = self.result;
        self.tested
    }

    fn test_result(&self) -> TestResult {
        self.tested
    }

    fn set_dac_voltage(&mut self, code: u16) {
        self.record(Record::DacVoltage(self.channel, code));
    }

    fn set_dac_current(&mut self, code: u16) {
        self.record(Record::DacCurrent(self.channel, code));
    }

    fn set_output_enable(&mut self, enable: bool, tasks: OutputEnableTasks) {
        self.record(Record::OutputEnable(self.channel, enable, tasks));
    }

    fn set_remote_sense(&mut self, enable: bool) {
        self.record(Record::RemoteSense(self.channel, enable));
    }

    fn set_remote_programming(&mut self, enable: bool) {
        self.record(Record::RemoteProgramming(self.channel, enable));
    }

    fn set_current_range(&mut self, range: CurrentRange) {
        self.record(Record::CurrentRange(self.channel, range));
    }

    fn adc_measure_all(&mut self) {
        self.record(Record::Measure(self.channel));
    }

    fn adc_measure_mon_dac(&mut self) {}

    fn is_cv_mode(&self) -> bool {
        self.cv
    }

    fn is_cc_mode(&self) -> bool {
        self.cc
    }

    fn is_power_ok(&self) -> bool {
        self.power_ok
    }

    fn is_reverse_polarity(&self) -> bool {
        self.reverse_polarity
    }
}

pub struct MockBoard {
    timeline: Timeline,
    now: Instant,
    pub stored_settings: [Option<ChannelSettings>; MAX_CHANNELS],
    pub stored_calibration: [Option<CalibrationConfiguration>; MAX_CHANNELS],
}

impl MockBoard {
    pub fn new(timeline: &Timeline) -> Self {
        Self {
            timeline: timeline.clone(),
            now: Instant::from_ticks(0),
            stored_settings: Default::default(),
            stored_calibration: Default::default(),
        }
    }

    pub fn advance_ms(&mut self, ms: u64) {
        self.now += crate::hardware::Duration::millis(ms);
    }

    fn record(&self, record: Record) {
        self.timeline.borrow_mut().push(record);
    }
}

impl DelayNs for MockBoard {
    fn delay_ns(&mut self, ns: u32) {
        self.record(Record::DelayUs(ns / 1000));
    }

    fn delay_us(&mut self, us: u32) {
        self.record(Record::DelayUs(us));
    }
}

impl EventSink for MockBoard {
    fn push_event(&mut self, event: Event) {
        self.record(Record::Event(event));
    }

    fn acknowledge(&mut self, event: Event) {
        self.record(Record::Acknowledge(event));
    }
}

impl Persistence for MockBoard {
    fn save(&mut self, channel: Channel, settings: &ChannelSettings) {
        self.stored_settings[channel as usize].replace(*settings);
        self.record(Record::Save(channel));
    }

    fn load_settings(&mut self, channel: Channel) -> Option<ChannelSettings> {
        self.stored_settings[channel as usize]
    }

    fn load_calibration(&mut self, channel: Channel) -> Option<CalibrationConfiguration> {
        self.stored_calibration[channel as usize].clone()
    }
}

impl SyncCommit for MockBoard {
    fn commit(&mut self, phase: SyncPhase) {
        self.record(Record::Commit(phase));
    }
}

impl Clock for MockBoard {
    fn now(&self) -> Instant {
        self.now
    }
}

pub type TestChannels = PsuChannels<MockDriver, MockBoard>;

/// Install and boot the given channels, then clear the timeline.
pub fn booted(installed: &[Channel]) -> (TestChannels, Timeline) {
    let timeline = Timeline::default();
    let mut channels = PsuChannels::new(MockBoard::new(&timeline));

    for (slot, channel) in installed.iter().enumerate() {
        channels.install(
            *channel,
            PARAMS,
            MockDriver::new(*channel, &timeline),
            slot as u8,
            0,
        );
    }

    channels.boot();
    timeline.borrow_mut().clear();
    (channels, timeline)
}

pub fn events(timeline: &Timeline) -> Vec<Event> {
    timeline
        .borrow()
        .iter()
        .filter_map(|record| match record {
            Record::Event(event) => Some(*event),
            _ => None,
        })
        .collect()
}

/// Get the position of the first record matching a predicate.
pub fn position(timeline: &Timeline, f: impl Fn(&Record) -> bool) -> Option<usize> {
    timeline.borrow().iter().position(f)
}
