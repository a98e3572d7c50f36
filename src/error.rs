// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use core::fmt;

/// modbus-ammeter Error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Invalid buffer size
    BufferSize,
    /// Invalid function code
    FnCode(u8),
    /// Invalid CRC
    Crc(u16, u16),
    /// Invalid byte count
    ByteCount(u8),
    /// Length Mismatch
    LengthMismatch(usize, usize),
    /// Protocol not Modbus
    ProtocolNotModbus(u16),
    /// An accumulator or sample counter would overflow before being read.
    ///
    /// The acquisition loop missed its read deadline; the device must restart.
    DeadlineMissed,
    /// A response arrived while no request was in flight.
    NoPendingTransaction,
    /// A request arrived while the previous one is still in flight.
    TransactionPending,
    /// No register block starts at this address.
    UnmappedAddress(u16),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;

        match self {
            BufferSize => write!(f, "Invalid buffer size"),
            FnCode(fn_code) => write!(f, "Invalid function code: 0x{fn_code:0>2X}"),
            Crc(expected, actual) => write!(
                f,
                "Invalid CRC: expected = 0x{expected:0>4X}, actual = 0x{actual:0>4X}"
            ),
            ByteCount(cnt) => write!(f, "Invalid byte count: {cnt}"),
            LengthMismatch(length_field, pdu_len) => write!(
                f,
                "Length Mismatch: Length Field: {length_field}, PDU Len + 1: {pdu_len}"
            ),
            ProtocolNotModbus(protocol_id) => {
                write!(f, "Protocol not Modbus(0), received {protocol_id} instead")
            }
            DeadlineMissed => write!(f, "Acquisition deadline missed: accumulator overflow"),
            NoPendingTransaction => write!(f, "No pending transaction"),
            TransactionPending => write!(f, "Previous transaction still pending"),
            UnmappedAddress(address) => write!(f, "Unmapped register address: 0x{address:0>4X}"),
        }
    }
}
