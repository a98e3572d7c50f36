// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-channel calibration scalars and their non-volatile storage
//!
//! A scalar is an unsigned 16 bit fixed-point multiplier: [`NEUTRAL`]
//! (mid-scale) means ×1.0, every other value scales linearly.
//! The persisted layout is one little-endian `u16` per channel, stored
//! contiguously from the store's base address.

use byteorder::{ByteOrder, LittleEndian};

/// Calibration multiplier of a single channel.
pub type Scalar = u16;

/// The ×1.0 scalar.
pub const NEUTRAL: Scalar = 0x8000;

/// `true` unless `scalar` is all zeros or an erased (all ones) cell.
#[must_use]
pub const fn is_valid_scalar(scalar: Scalar) -> bool {
    scalar != 0x0000 && scalar != 0xFFFF
}

/// Calibration of all channels.
#[cfg_attr(all(feature = "defmt", target_os = "none"), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration<const N: usize> {
    scalars: [Scalar; N],
}

impl<const N: usize> Calibration<N> {
    /// All channels at ×1.0.
    #[must_use]
    pub const fn neutral() -> Self {
        Self {
            scalars: [NEUTRAL; N],
        }
    }

    /// Build a calibration, invalid scalars fall back to [`NEUTRAL`].
    #[must_use]
    pub fn from_scalars(mut scalars: [Scalar; N]) -> Self {
        for s in &mut scalars {
            if !is_valid_scalar(*s) {
                *s = NEUTRAL;
            }
        }
        Self { scalars }
    }

    #[must_use]
    pub fn scalar(&self, channel: usize) -> Option<Scalar> {
        self.scalars.get(channel).copied()
    }

    #[must_use]
    pub const fn scalars(&self) -> &[Scalar; N] {
        &self.scalars
    }
}

impl<const N: usize> Default for Calibration<N> {
    fn default() -> Self {
        Self::neutral()
    }
}

/// Byte addressable non-volatile memory, e.g. the MCU data EEPROM.
///
/// Writes are single-byte and synchronous.
pub trait NvStorage {
    fn read_byte(&mut self, address: u16) -> u8;
    fn write_byte(&mut self, address: u16, value: u8);
}

impl<S: NvStorage + ?Sized> NvStorage for &mut S {
    fn read_byte(&mut self, address: u16) -> u8 {
        (**self).read_byte(address)
    }

    fn write_byte(&mut self, address: u16, value: u8) {
        (**self).write_byte(address, value);
    }
}

/// Persists a [`Calibration`] at a fixed location of an [`NvStorage`].
#[derive(Debug)]
pub struct CalibrationStore<S, const N: usize> {
    storage: S,
    base_address: u16,
}

impl<S: NvStorage, const N: usize> CalibrationStore<S, N> {
    /// Number of bytes occupied in the storage.
    pub const SIZE: usize = N * 2;

    pub const fn new(storage: S, base_address: u16) -> Self {
        Self {
            storage,
            base_address,
        }
    }

    /// Read the persisted calibration.
    ///
    /// Uninitialized or corrupt cells yield the neutral scalar for that
    /// channel, this never fails.
    pub fn load(&mut self) -> Calibration<N> {
        let mut scalars = [NEUTRAL; N];
        for (i, scalar) in scalars.iter_mut().enumerate() {
            let address = self.scalar_address(i);
            let bytes = [
                self.storage.read_byte(address),
                self.storage.read_byte(address.wrapping_add(1)),
            ];
            let value = LittleEndian::read_u16(&bytes);
            if is_valid_scalar(value) {
                *scalar = value;
            } else {
                #[cfg(feature = "log")]
                log::debug!("Calibration of channel {i} uninitialized (0x{value:0>4X})");
            }
        }
        Calibration { scalars }
    }

    /// Persist all scalars, one byte at a time.
    ///
    /// Bytes already holding the target value are not rewritten. An
    /// interrupted write leaves a mix of old and new bytes which
    /// [`CalibrationStore::load`] either accepts or defaults.
    pub fn write(&mut self, calibration: &Calibration<N>) {
        for (i, scalar) in calibration.scalars.iter().enumerate() {
            let mut bytes = [0; 2];
            LittleEndian::write_u16(&mut bytes, *scalar);
            let address = self.scalar_address(i);
            for (offset, byte) in bytes.into_iter().enumerate() {
                let address = address.wrapping_add(offset as u16);
                if self.storage.read_byte(address) != byte {
                    self.storage.write_byte(address, byte);
                }
            }
        }
    }

    pub fn into_inner(self) -> S {
        self.storage
    }

    fn scalar_address(&self, channel: usize) -> u16 {
        self.base_address.wrapping_add((channel * 2) as u16)
    }
}


#[cfg(test)]
mod tests {
    use super::sim::RamStorage;
    use super::*;

    #[test]
    fn load_erased_storage() {
        let mut store = CalibrationStore::<_, 2>::new(RamStorage::erased(), 0);
        assert_eq!(store.load(), Calibration::neutral());
    }

    #[test]
    fn load_zeroed_storage() {
        let mut storage = RamStorage::erased();
        storage.bytes = [0; 64];
        let mut store = CalibrationStore::<_, 2>::new(storage, 0);
        assert_eq!(store.load(), Calibration::neutral());
    }

    #[test]
    fn write_then_load() {
        let mut store = CalibrationStore::<_, 2>::new(RamStorage::erased(), 0x10);
        for scalars in [[0x8000, 0x8000], [0x0001, 0xFFFE], [0x7A12, 0x9000]] {
            let calibration = Calibration::from_scalars(scalars);
            store.write(&calibration);
            assert_eq!(store.load(), calibration);
        }
        let storage = store.into_inner();
        assert_eq!(&storage.bytes[0x10..0x14], &[0x12, 0x7A, 0x00, 0x90]);
        assert_eq!(storage.bytes[0x0F], 0xFF);
        assert_eq!(storage.bytes[0x14], 0xFF);
    }

    #[test]
    fn rewrite_skips_unchanged_bytes() {
        let mut store = CalibrationStore::<_, 2>::new(RamStorage::erased(), 0);
        let calibration = Calibration::from_scalars([0x8001, 0x8000]);
        store.write(&calibration);
        store.write(&calibration);
        assert_eq!(store.into_inner().writes, 4);
    }

    #[test]
    fn partially_written_calibration_is_accepted() {
        let mut storage = RamStorage::erased();
        // Power lost after the low byte of channel 1
        storage.bytes[0] = 0x00;
        storage.bytes[1] = 0x90;
        storage.bytes[2] = 0x34;
        let mut store = CalibrationStore::<_, 2>::new(storage, 0);
        let calibration = store.load();
        assert_eq!(calibration.scalar(0), Some(0x9000));
        // 0xFF34 is a valid, if stale looking, scalar
        assert_eq!(calibration.scalar(1), Some(0xFF34));
    }

    #[test]
    fn invalid_scalars_are_replaced() {
        let calibration = Calibration::from_scalars([0, 0xFFFF, 0x4000]);
        assert_eq!(calibration.scalars(), &[NEUTRAL, NEUTRAL, 0x4000]);
    }
}
