// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus TCP

use super::*;

pub mod server;
pub use crate::frame::tcp::*;

/// Size of the MBAP header including the unit id.
pub const MBAP_HEADER_LEN: usize = 7;

// [MODBUS MESSAGING ON TCP/IP IMPLEMENTATION GUIDE V1.0b](http://modbus.org/docs/Modbus_Messaging_Implementation_Guide_V1_0b.pdf), page 18
// "a MODBUS request needs a maximum of 256 bytes + the MBAP header size"
pub const MAX_FRAME_LEN: usize = 256 + MBAP_HEADER_LEN;

/// An extracted TCP PDU frame.
#[cfg_attr(all(feature = "defmt", target_os = "none"), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame<'a> {
    pub transaction_id: TransactionId,
    pub unit_id: UnitId,
    pub pdu: &'a [u8],
}

/// Extract a PDU frame out of a buffer.
///
/// The PDU length is taken from the MBAP length field, the bridge
/// forwards PDUs without interpreting them.
pub fn extract_frame(buf: &[u8]) -> Result<Option<(DecodedFrame<'_>, FrameLocation)>> {
    if buf.len() < MBAP_HEADER_LEN {
        return Ok(None);
    }
    let transaction_id = BigEndian::read_u16(&buf[0..2]);
    let protocol_id = BigEndian::read_u16(&buf[2..4]);
    if protocol_id != 0 {
        return Err(Error::ProtocolNotModbus(protocol_id));
    }
    let m_length = BigEndian::read_u16(&buf[4..6]) as usize;
    // Unit id plus at least the function code
    if m_length < 2 || m_length + 6 > MAX_FRAME_LEN {
        return Err(Error::LengthMismatch(m_length, 2));
    }
    let adu_len = 6 + m_length;
    if buf.len() < adu_len {
        // Incomplete frame
        return Ok(None);
    }
    let unit_id = buf[6];
    let frame = DecodedFrame {
        transaction_id,
        unit_id,
        pdu: &buf[MBAP_HEADER_LEN..adu_len],
    };
    Ok(Some((
        frame,
        FrameLocation {
            start: 0,
            size: adu_len,
        },
    )))
}
