// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus RTU

use super::*;

pub mod server;
pub use crate::frame::rtu::*;

// [MODBUS over Serial Line Specification and Implementation Guide V1.02](http://modbus.org/docs/Modbus_over_serial_line_V1_02.pdf), page 13
// "The maximum size of a MODBUS RTU frame is 256 bytes."
pub const MAX_FRAME_LEN: usize = 256;

/// Length of the CRC trailer.
pub const CRC_LEN: usize = 2;

/// An extracted RTU PDU frame.
#[cfg_attr(all(feature = "defmt", target_os = "none"), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame<'a> {
    pub slave: SlaveId,
    pub pdu: &'a [u8],
}

/// Extract a PDU frame out of a buffer.
///
/// Returns `Ok(None)` as long as the frame is incomplete.
#[allow(clippy::similar_names)]
pub fn extract_frame(buf: &[u8], pdu_len: usize) -> Result<Option<DecodedFrame<'_>>> {
    if buf.is_empty() {
        return Err(Error::BufferSize);
    }

    let adu_len = 1 + pdu_len;
    if buf.len() >= adu_len + CRC_LEN {
        let (adu_buf, buf) = buf.split_at(adu_len);
        let (crc_buf, _) = buf.split_at(CRC_LEN);
        // Read trailing CRC and verify ADU
        let expected_crc = BigEndian::read_u16(crc_buf);
        let actual_crc = crc16(adu_buf);
        if expected_crc != actual_crc {
            return Err(Error::Crc(expected_crc, actual_crc));
        }
        let (slave_id, pdu_data) = adu_buf.split_at(1);
        return Ok(Some(DecodedFrame {
            slave: slave_id[0],
            pdu: pdu_data,
        }));
    }
    // Incomplete frame
    Ok(None)
}

/// Append the CRC trailer to the `len` ADU bytes at the start of `buf`.
///
/// Returns the length of the complete frame.
pub fn write_crc(buf: &mut [u8], len: usize) -> Result<usize> {
    if buf.len() < len + CRC_LEN {
        return Err(Error::BufferSize);
    }
    let crc = crc16(&buf[..len]);
    BigEndian::write_u16(&mut buf[len..], crc);
    Ok(len + CRC_LEN)
}

/// Calculate the CRC (Cyclic Redundancy Check) sum.
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0xFFFF;
    for x in data {
        crc ^= u16::from(*x);
        for _ in 0..8 {
            // if we followed clippy's suggestion to move out the crc >>= 1, the condition may not be met any more
            // the recommended action therefore makes no sense and it is better to allow this lint
            #[allow(clippy::branches_sharing_code)]
            if (crc & 0x0001) != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc.rotate_right(8)
}

/// Extract the PDU length out of the ADU request buffer.
pub const fn request_pdu_len(adu_buf: &[u8]) -> Result<Option<usize>> {
    if adu_buf.len() < 2 {
        return Ok(None);
    }
    let fn_code = adu_buf[1];
    let len = match fn_code {
        0x01..=0x06 => Some(5),
        0x0F | 0x10 => {
            if adu_buf.len() > 6 {
                Some(6 + adu_buf[6] as usize)
            } else {
                // incomplete frame
                None
            }
        }
        0x17 => {
            if adu_buf.len() > 10 {
                Some(10 + adu_buf[10] as usize)
            } else {
                // incomplete frame
                None
            }
        }
        _ => {
            return Err(Error::FnCode(fn_code));
        }
    };
    Ok(len)
}

/// Extract the PDU length out of the ADU response buffer.
pub const fn response_pdu_len(adu_buf: &[u8]) -> Result<Option<usize>> {
    if adu_buf.len() < 2 {
        return Ok(None);
    }
    let fn_code = adu_buf[1];
    let len = match fn_code {
        0x01..=0x04 | 0x17 => {
            if adu_buf.len() > 2 {
                Some(2 + adu_buf[2] as usize)
            } else {
                // incomplete frame
                None
            }
        }
        0x05 | 0x06 | 0x0F | 0x10 => Some(5),
        0x81..=0xAB => Some(2),
        _ => return Err(Error::FnCode(fn_code)),
    };
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calc_crc16() {
        let msg = &[0x01, 0x03, 0x08, 0x2B, 0x00, 0x02];
        assert_eq!(crc16(msg), 0xB663);

        let msg = &[0x01, 0x03, 0x04, 0x00, 0x20, 0x00, 0x00];
        assert_eq!(crc16(msg), 0xFBF9);
    }

    #[test]
    fn append_crc() {
        let buf = &mut [0x01, 0x03, 0x08, 0x2B, 0x00, 0x02, 0, 0];
        assert_eq!(write_crc(buf, 6).unwrap(), 8);
        assert_eq!(&buf[6..], &[0xB6, 0x63]);
        assert_eq!(write_crc(buf, 7), Err(Error::BufferSize));
    }

    #[test]
    fn test_request_pdu_len() {
        let buf = &mut [0x66, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(request_pdu_len(buf).is_err());

        buf[1] = 0x03;
        assert_eq!(request_pdu_len(buf).unwrap(), Some(5));

        buf[1] = 0x06;
        assert_eq!(request_pdu_len(buf).unwrap(), Some(5));

        buf[1] = 0x10;
        buf[6] = 4;
        assert_eq!(request_pdu_len(buf).unwrap(), Some(10));

        assert_eq!(request_pdu_len(&[0x12, 0x10, 0x00]).unwrap(), None);
    }

    #[test]
    fn test_get_response_pdu_len() {
        let buf = &mut [0x66, 0x03, 8];
        assert_eq!(response_pdu_len(buf).unwrap(), Some(10));

        let buf = &mut [0x66, 0x00, 99, 0x00];
        assert_eq!(response_pdu_len(buf).err().unwrap(), Error::FnCode(0));

        buf[1] = 0x10;
        assert_eq!(response_pdu_len(buf).unwrap(), Some(5));

        for i in 0x81..0xAB {
            buf[1] = i;
            assert_eq!(response_pdu_len(buf).unwrap(), Some(2));
        }
    }

    mod frame_decoder {

        use super::*;

        #[test]
        fn extract_partly_received_rtu_frame() {
            let buf = &[
                0x12, // slave address
                0x03, // function code
                0x02, // byte count
                0x00, // data
                0x00, // data
                0x00, // CRC first byte
                      // missing crc second byte
            ];
            let pdu_len = response_pdu_len(buf).unwrap().unwrap();
            let res = extract_frame(buf, pdu_len).unwrap();
            assert!(res.is_none());
        }

        #[test]
        fn extract_usual_rtu_response_frame() {
            let buf = &[
                0x01, // slave address
                0x03, // function code
                0x04, // byte count
                0x89, //
                0x02, //
                0x42, //
                0xC7, //
                0x00, // crc
                0x9D, // crc
                0x03, // -- start of next frame
            ];
            let pdu_len = response_pdu_len(buf).unwrap().unwrap();
            let DecodedFrame { slave, pdu } = extract_frame(buf, pdu_len).unwrap().unwrap();
            assert_eq!(slave, 0x01);
            assert_eq!(pdu.len(), 6);
        }

        #[test]
        fn extract_frame_with_bad_crc() {
            let buf = &[0x01, 0x03, 0x04, 0x89, 0x02, 0x42, 0xC7, 0x00, 0x9E];
            let pdu_len = response_pdu_len(buf).unwrap().unwrap();
            assert_eq!(
                extract_frame(buf, pdu_len),
                Err(Error::Crc(0x009E, 0x009D))
            );
        }
    }
}
