// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::*;
use crate::error::*;

/// Register values in wire order (big-endian words).
#[cfg_attr(all(feature = "defmt", target_os = "none"), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Data<'d> {
    pub(crate) data: &'d [u8],
    pub(crate) quantity: usize,
}

impl<'d> Data<'d> {
    /// Pack words into `target`.
    pub fn from_words(words: &[Word], target: &'d mut [u8]) -> Result<Self, Error> {
        let len = words.len() * 2;
        if words.is_empty() || len > target.len() {
            return Err(Error::BufferSize);
        }
        for (word, chunk) in words.iter().zip(target.chunks_exact_mut(2)) {
            BigEndian::write_u16(chunk, *word);
        }
        Ok(Data {
            data: &target[..len],
            quantity: words.len(),
        })
    }

    /// Wrap register bytes that are already in wire order.
    pub fn from_bytes(bytes: &'d [u8]) -> Result<Self, Error> {
        if bytes.is_empty() || bytes.len() % 2 != 0 {
            return Err(Error::BufferSize);
        }
        Ok(Data {
            data: bytes,
            quantity: bytes.len() / 2,
        })
    }

    pub(crate) fn copy_to(&self, buf: &mut [u8]) {
        let len = self.quantity * 2;
        debug_assert!(buf.len() >= len);
        buf[..len].copy_from_slice(&self.data[..len]);
    }

    /// Number of registers.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.quantity
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.quantity == 0
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<Word> {
        if idx >= self.quantity {
            return None;
        }
        let offset = idx * 2;
        Some(BigEndian::read_u16(&self.data[offset..offset + 2]))
    }
}
