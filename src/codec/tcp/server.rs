// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus TCP server (slave) specific functions.
use super::*;

/// Decode a TCP request into its header and raw PDU.
pub fn decode_request(buf: &[u8]) -> Result<Option<(Header, &[u8])>> {
    let Some((frame, _location)) = extract_frame(buf).inspect_err(|_err| {
        #[cfg(feature = "log")]
        log::warn!("Failed to decode TCP request: {_err}");
    })?
    else {
        return Ok(None);
    };
    let DecodedFrame {
        transaction_id,
        unit_id,
        pdu,
    } = frame;
    let hdr = Header {
        transaction_id,
        unit_id,
    };
    Ok(Some((hdr, pdu)))
}

/// Encode a TCP response around a raw PDU.
pub fn encode_response(hdr: Header, pdu: &[u8], buf: &mut [u8]) -> Result<usize> {
    let len = pdu.len();
    if pdu.is_empty() || buf.len() < len + MBAP_HEADER_LEN {
        return Err(Error::BufferSize);
    }
    BigEndian::write_u16(&mut buf[0..2], hdr.transaction_id);
    BigEndian::write_u16(&mut buf[2..4], 0); //MODBUS Protocol
    BigEndian::write_u16(&mut buf[4..6], (len + 1) as u16);
    buf[6] = hdr.unit_id;
    buf[MBAP_HEADER_LEN..MBAP_HEADER_LEN + len].copy_from_slice(pdu);
    Ok(len + MBAP_HEADER_LEN)
}

/// Encode a TCP exception response.
pub fn encode_exception(hdr: Header, ex: ExceptionResponse, buf: &mut [u8]) -> Result<usize> {
    let pdu: [u8; 2] = ex.into();
    encode_response(hdr, &pdu, buf)
}
