// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Non-blocking analog to digital converter capability

/// Raw conversion result, right justified.
pub type Sample = u16;

/// A single ADC shared between several multiplexed input channels.
///
/// None of the methods may block: a conversion is started with
/// [`Adc::start_conversion`] and polled with [`Adc::conversion_complete`].
pub trait Adc {
    /// Route the input of channel `index` to the converter.
    fn select_channel(&mut self, index: usize);

    /// Start a conversion on the selected channel.
    fn start_conversion(&mut self);

    /// `true` once the started conversion has finished.
    fn conversion_complete(&mut self) -> bool;

    /// Result of the last finished conversion.
    fn read_raw(&mut self) -> Sample;
}
