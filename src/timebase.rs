// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Monotonic tick source

/// Tick counter value. Wraps around, compare with [`elapsed`].
pub type Tick = u32;

/// Monotonic, wrapping tick counter provided by the platform.
pub trait Timebase {
    /// Current tick count.
    fn now(&self) -> Tick;

    /// Number of ticks per second.
    fn ticks_per_second(&self) -> u32;
}

/// Ticks elapsed from `since` to `now`, across a counter wrap.
#[must_use]
pub const fn elapsed(now: Tick, since: Tick) -> Tick {
    now.wrapping_sub(since)
}
