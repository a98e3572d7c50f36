// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![doc = include_str!("../README.md")]
#![cfg_attr(not(test), no_std)]

mod codec;
mod error;
mod frame;

pub mod timebase;

#[cfg(feature = "node")]
pub mod adc;
#[cfg(feature = "node")]
pub mod calibration;
#[cfg(feature = "node")]
pub mod integrator;
#[cfg(feature = "node")]
pub mod node;
#[cfg(feature = "node")]
pub mod registers;

#[cfg(feature = "bridge")]
pub mod bridge;
#[cfg(feature = "bridge")]
pub mod recovery;

pub use codec::rtu;
#[cfg(feature = "bridge")]
pub use codec::tcp;
pub use error::*;
pub use frame::*;
