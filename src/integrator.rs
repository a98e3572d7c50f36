// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Analog integrator
//!
//! Cooperative acquisition state machine sampling every channel at a fixed
//! rate through a shared [`Adc`]. Samples are summed into a signed 32 bit
//! accumulator per channel and turned into calibrated Q16.16 readings.
//!
//! With a 10 bit converter and 4 samples per second the accumulator could
//! hold about 145 hours of samples, but the 16 bit sample counter wraps
//! first (about 4.5 hours without a read). Both limits are checked on every
//! sample: exceeding one means the node was not read in time, which is
//! reported as [`Error::DeadlineMissed`] and must restart the device.

use core::cell::RefCell;

use crate::{
    adc::{Adc, Sample},
    calibration::{Calibration, NEUTRAL, Scalar},
    error::Error,
    timebase::{Tick, Timebase, elapsed},
};

/// Channels of the reference hardware (AN11 and AN9).
pub const CHANNELS: usize = 2;

/// How readings are produced.
#[cfg_attr(all(feature = "defmt", target_os = "none"), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Publish the calibrated average every `periods_per_output` sampling
    /// loops. A read returns the last published period.
    Averaging { periods_per_output: u8 },
    /// Keep accumulating until read. A read returns the raw accumulator and
    /// sample count since the previous read and restarts; the client divides.
    Accumulating,
}

#[cfg_attr(all(feature = "defmt", target_os = "none"), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegratorConfig {
    /// Sampling rate of every single channel.
    pub samples_per_second: u32,
    pub mode: Mode,
}

impl IntegratorConfig {
    /// 4 Hz per channel, one averaged output per second.
    pub const DEFAULT: Self = Self {
        samples_per_second: 4,
        mode: Mode::Averaging {
            periods_per_output: 4,
        },
    };

    /// 4 Hz per channel, accumulate until read.
    pub const ACCUMULATING: Self = Self {
        samples_per_second: 4,
        mode: Mode::Accumulating,
    };

    /// Ticks between two conversions, whatever the channel.
    #[must_use]
    pub const fn per_channel_period(&self, ticks_per_second: u32, channels: usize) -> Tick {
        if self.samples_per_second == 0 || channels == 0 {
            return 1;
        }
        let loop_period = ticks_per_second / self.samples_per_second;
        let period = loop_period / channels as u32;
        if period == 0 { 1 } else { period }
    }
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Reading of one channel.
#[cfg_attr(all(feature = "defmt", target_os = "none"), derive(defmt::Format))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    /// Calibrated Q16.16 average, or the raw sample sum when accumulating.
    pub value: u32,
    /// Number of samples the value was computed from.
    pub count: u16,
}

/// Readings of all channels, as returned by [`Integrator::read`].
///
/// An empty snapshot (nothing sampled since the previous read) holds all
/// zero readings.
#[cfg_attr(all(feature = "defmt", target_os = "none"), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot<const N: usize = CHANNELS> {
    pub readings: [Reading; N],
}

impl<const N: usize> Default for Snapshot<N> {
    fn default() -> Self {
        Self {
            readings: [Reading::default(); N],
        }
    }
}

impl<const N: usize> Snapshot<N> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.readings.iter().all(|r| r.count == 0)
    }
}

/// Anything a register map can pull a snapshot from.
pub trait SnapshotSource<const N: usize> {
    fn read(&mut self) -> Snapshot<N>;
}

/// `(accumulator × scalar) / count` in Q16.16, scaled so that the
/// [`NEUTRAL`] scalar yields the plain average shifted by 16 bits.
#[must_use]
pub fn calibrate(accumulator: i32, count: u16, scalar: Scalar) -> u32 {
    if count == 0 || accumulator <= 0 {
        return 0;
    }
    let numerator = ((accumulator as u64) * u64::from(scalar)) << 16;
    let denominator = u64::from(count) * u64::from(NEUTRAL);
    u32::try_from(numerator / denominator).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Channel {
    accumulator: i32,
    count: u16,
    calibration: Scalar,
}

impl Channel {
    const fn new(calibration: Scalar) -> Self {
        Self {
            accumulator: 0,
            count: 0,
            calibration,
        }
    }

    fn accumulate(&mut self, sample: Sample) -> Result<(), Error> {
        let accumulator = self
            .accumulator
            .checked_add(i32::from(sample))
            .ok_or(Error::DeadlineMissed)?;
        let count = self.count.checked_add(1).ok_or(Error::DeadlineMissed)?;
        self.accumulator = accumulator;
        self.count = count;
        Ok(())
    }

    fn take_average(&mut self) -> Reading {
        let reading = Reading {
            value: calibrate(self.accumulator, self.count, self.calibration),
            count: self.count,
        };
        self.clear();
        reading
    }

    fn take_raw(&mut self) -> Reading {
        // Never negative, samples are unsigned and overflow is rejected
        let reading = Reading {
            value: self.accumulator as u32,
            count: self.count,
        };
        self.clear();
        reading
    }

    fn clear(&mut self) {
        self.accumulator = 0;
        self.count = 0;
    }
}

#[cfg_attr(all(feature = "defmt", target_os = "none"), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for the next acquisition slot.
    Idle,
    /// Conversion running on the current channel.
    Sampling,
    /// An accumulator overflowed, acquisition stopped.
    Faulted,
}

/// Acquisition state of all channels.
#[derive(Debug)]
pub struct Integrator<A, T, const N: usize = CHANNELS> {
    adc: A,
    timebase: T,
    mode: Mode,
    per_channel_period: Tick,
    channels: [Channel; N],
    state: State,
    cursor: usize,
    last_start: Tick,
    periods: u8,
    published: Snapshot<N>,
}

impl<A: Adc, T: Timebase, const N: usize> Integrator<A, T, N> {
    pub fn new(
        adc: A,
        timebase: T,
        config: IntegratorConfig,
        calibration: &Calibration<N>,
    ) -> Self {
        debug_assert!(N > 0);
        let per_channel_period = config.per_channel_period(timebase.ticks_per_second(), N);
        let mut channels = [Channel::new(NEUTRAL); N];
        for (channel, scalar) in channels.iter_mut().zip(calibration.scalars()) {
            channel.calibration = *scalar;
        }
        let last_start = timebase.now();
        Self {
            adc,
            timebase,
            mode: config.mode,
            per_channel_period,
            channels,
            state: State::Idle,
            cursor: 0,
            last_start,
            periods: 0,
            published: Snapshot::default(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    #[must_use]
    pub const fn is_faulted(&self) -> bool {
        matches!(self.state, State::Faulted)
    }

    /// Replace the calibration, pending samples are kept.
    pub fn set_calibration(&mut self, calibration: &Calibration<N>) {
        for (channel, scalar) in self.channels.iter_mut().zip(calibration.scalars()) {
            channel.calibration = *scalar;
        }
    }

    #[must_use]
    pub fn calibration(&self) -> Calibration<N> {
        Calibration::from_scalars(self.channels.map(|c| c.calibration))
    }

    /// Advance the state machine by at most one transition.
    ///
    /// Never blocks. Returns [`Error::DeadlineMissed`] exactly once when a
    /// sample can't be accumulated without overflow; the integrator then
    /// stays in [`State::Faulted`] and takes no further samples.
    pub fn poll(&mut self) -> Result<(), Error> {
        match self.state {
            State::Idle => {
                let now = self.timebase.now();
                if elapsed(now, self.last_start) >= self.per_channel_period {
                    self.adc.select_channel(self.cursor);
                    self.adc.start_conversion();
                    self.last_start = now;
                    self.state = State::Sampling;
                }
                Ok(())
            }
            State::Sampling => {
                if !self.adc.conversion_complete() {
                    return Ok(());
                }
                let sample = self.adc.read_raw();
                if let Err(err) = self.channels[self.cursor].accumulate(sample) {
                    #[cfg(feature = "log")]
                    log::error!(
                        "Channel {} overflow after {} samples: {err}",
                        self.cursor,
                        self.channels[self.cursor].count
                    );
                    self.state = State::Faulted;
                    return Err(err);
                }
                self.state = State::Idle;
                self.next_channel();
                Ok(())
            }
            State::Faulted => Ok(()),
        }
    }

    fn next_channel(&mut self) {
        self.cursor += 1;
        if self.cursor < N {
            return;
        }
        self.cursor = 0;
        if let Mode::Averaging { periods_per_output } = self.mode {
            self.periods += 1;
            if self.periods >= periods_per_output {
                self.periods = 0;
                self.published.readings = self.channels.each_mut().map(Channel::take_average);
            }
        }
    }

    /// Take the current readings and start a new read cycle.
    ///
    /// Averaging: the last completed period, which is consumed; the period
    /// in progress is left alone. Accumulating: the raw sum and count of
    /// everything sampled since the previous read.
    pub fn read(&mut self) -> Snapshot<N> {
        match self.mode {
            Mode::Averaging { .. } => core::mem::take(&mut self.published),
            Mode::Accumulating => Snapshot {
                readings: self.channels.each_mut().map(Channel::take_raw),
            },
        }
    }
}

impl<A: Adc, T: Timebase, const N: usize> SnapshotSource<N> for Integrator<A, T, N> {
    fn read(&mut self) -> Snapshot<N> {
        Integrator::read(self)
    }
}

/// An [`Integrator`] shared with interrupt handlers or other threads.
///
/// `poll` and `read` each run inside a critical section, so the copy and
/// reset of a read never interleaves with an accumulation.
pub struct Shared<A, T, const N: usize = CHANNELS> {
    inner: critical_section::Mutex<RefCell<Integrator<A, T, N>>>,
}

impl<A: Adc, T: Timebase, const N: usize> Shared<A, T, N> {
    pub const fn new(integrator: Integrator<A, T, N>) -> Self {
        Self {
            inner: critical_section::Mutex::new(RefCell::new(integrator)),
        }
    }

    pub fn poll(&self) -> Result<(), Error> {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).poll())
    }

    pub fn read(&self) -> Snapshot<N> {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).read())
    }

    pub fn set_calibration(&self, calibration: &Calibration<N>) {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).set_calibration(calibration));
    }
}

impl<A: Adc, T: Timebase, const N: usize> SnapshotSource<N> for &Shared<A, T, N> {
    fn read(&mut self) -> Snapshot<N> {
        Shared::read(*self)
    }
}
