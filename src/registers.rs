// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Holding register map of the sensor node
//!
//! | Address  | Registers          | Access              |
//! |----------|--------------------|---------------------|
//! | `0x0000` | 2                  | read, write = reset |
//! | `0x0200` | 2 or 3 per channel | read only           |
//!
//! Requests must address a block with its exact register count. 32 bit
//! values are sent as two registers, low word first.

use byteorder::{BigEndian, ByteOrder};

use crate::{
    error::Error,
    frame::{Address, Data, Exception, FunctionCode, Quantity},
    integrator::{CHANNELS, Mode, SnapshotSource},
};

/// Start address of the system block.
pub const SYSTEM_ADDRESS: Address = 0x0000;

/// Registers of the system block.
pub const SYSTEM_REGISTERS: Quantity = 2;

/// Start address of the sensor block.
pub const SENSOR_ADDRESS: Address = 0x0200;

/// Why the device (re)started.
#[cfg_attr(all(feature = "defmt", target_os = "none"), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ResetReason {
    /// Cleared by the client.
    #[default]
    None = 0x00,
    PowerOn = 0x01,
    Brownout = 0x02,
    Watchdog = 0x03,
    /// Reset pin or explicit software reset.
    External = 0x04,
    StackOverflow = 0x05,
    /// The integrator wasn't read before an accumulator overflow.
    DeadlineMissed = 0x10,
}

impl ResetReason {
    #[must_use]
    pub const fn value(self) -> u8 {
        self as u8
    }
}

/// Diagnostics exposed through the system block.
#[cfg_attr(all(feature = "defmt", target_os = "none"), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SystemStatus {
    pub reset_reason: ResetReason,
    /// Frames dropped because of a CRC mismatch, saturating.
    pub crc_errors: u8,
}

impl SystemStatus {
    #[must_use]
    pub const fn new(reset_reason: ResetReason) -> Self {
        Self {
            reset_reason,
            crc_errors: 0,
        }
    }

    pub fn record_crc_error(&mut self) {
        self.crc_errors = self.crc_errors.saturating_add(1);
    }

    pub fn clear(&mut self) {
        *self = Self::new(ResetReason::None);
    }

    fn encode(&self) -> [u8; 4] {
        [self.reset_reason.value(), 0, self.crc_errors, 0]
    }
}

/// Serialization of one channel in the sensor block.
#[cfg_attr(all(feature = "defmt", target_os = "none"), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorLayout {
    /// `u32` value.
    Value,
    /// `u32` value followed by the `u16` sample count.
    ValueAndCount,
}

impl SensorLayout {
    #[must_use]
    pub const fn registers_per_channel(self) -> Quantity {
        match self {
            Self::Value => 2,
            Self::ValueAndCount => 3,
        }
    }
}

impl From<Mode> for SensorLayout {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Averaging { .. } => Self::Value,
            Mode::Accumulating => Self::ValueAndCount,
        }
    }
}

/// A block of the register map.
#[cfg_attr(all(feature = "defmt", target_os = "none"), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    System,
    Sensor,
}

impl Block {
    #[must_use]
    pub const fn address(self) -> Address {
        match self {
            Self::System => SYSTEM_ADDRESS,
            Self::Sensor => SENSOR_ADDRESS,
        }
    }

    #[must_use]
    pub const fn from_address(address: Address) -> Option<Self> {
        match address {
            SYSTEM_ADDRESS => Some(Self::System),
            SENSOR_ADDRESS => Some(Self::Sensor),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMap<const N: usize = CHANNELS> {
    layout: SensorLayout,
    status: SystemStatus,
}

impl<const N: usize> RegisterMap<N> {
    #[must_use]
    pub const fn new(layout: SensorLayout, reset_reason: ResetReason) -> Self {
        Self {
            layout,
            status: SystemStatus::new(reset_reason),
        }
    }

    #[must_use]
    pub const fn layout(&self) -> SensorLayout {
        self.layout
    }

    #[must_use]
    pub const fn status(&self) -> &SystemStatus {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut SystemStatus {
        &mut self.status
    }

    /// Exact register count of `block`.
    #[must_use]
    pub const fn block_size(&self, block: Block) -> Quantity {
        match block {
            Block::System => SYSTEM_REGISTERS,
            Block::Sensor => self.layout.registers_per_channel() * N as Quantity,
        }
    }

    /// Check a request against the table: address, then count, then function.
    pub fn validate(
        &self,
        address: Address,
        count: Quantity,
        function: FunctionCode,
    ) -> Result<Block, Exception> {
        let block = Block::from_address(address).ok_or(Exception::IllegalDataAddress)?;
        let size = self.block_size(block);
        if count != size {
            return Err(Exception::IllegalDataValue);
        }
        let allowed = match block {
            Block::System => match function {
                FunctionCode::ReadHoldingRegisters | FunctionCode::WriteMultipleRegisters => true,
                FunctionCode::WriteSingleRegister => size == 1,
                _ => false,
            },
            Block::Sensor => function == FunctionCode::ReadHoldingRegisters,
        };
        if !allowed {
            return Err(Exception::IllegalFunction);
        }
        Ok(block)
    }

    /// Apply a validated write. The written data is ignored: any write to
    /// the system block clears the diagnostics.
    ///
    /// Returns `false` if `address` is not writable.
    pub fn on_receive(&mut self, address: Address, _data: Data<'_>) -> bool {
        match Block::from_address(address) {
            Some(Block::System) => {
                #[cfg(feature = "log")]
                log::debug!("Clear system status {:?}", self.status);
                self.status.clear();
                true
            }
            _ => false,
        }
    }

    /// Serialize a validated read into `out`, returning the number of bytes.
    ///
    /// Reading the sensor block consumes a snapshot of `source`.
    pub fn on_send<S>(
        &mut self,
        address: Address,
        source: &mut S,
        out: &mut [u8],
    ) -> Result<usize, Error>
    where
        S: SnapshotSource<N> + ?Sized,
    {
        let block = Block::from_address(address).ok_or(Error::UnmappedAddress(address))?;
        let len = usize::from(self.block_size(block)) * 2;
        if out.len() < len {
            return Err(Error::BufferSize);
        }
        match block {
            Block::System => out[..len].copy_from_slice(&self.status.encode()),
            Block::Sensor => {
                let snapshot = source.read();
                let stride = usize::from(self.layout.registers_per_channel()) * 2;
                let chunks = out[..len].chunks_exact_mut(stride);
                for (reading, chunk) in snapshot.readings.iter().zip(chunks) {
                    let low = reading.value as u16;
                    let high = (reading.value >> 16) as u16;
                    BigEndian::write_u16(&mut chunk[0..2], low);
                    BigEndian::write_u16(&mut chunk[2..4], high);
                    if self.layout == SensorLayout::ValueAndCount {
                        BigEndian::write_u16(&mut chunk[4..6], reading.count);
                    }
                }
            }
        }
        Ok(len)
    }
}
