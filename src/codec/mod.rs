// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{error::*, frame::*};
use byteorder::{BigEndian, ByteOrder};
use core::convert::TryFrom;

pub mod rtu;
#[cfg(feature = "bridge")]
pub mod tcp;

type Result<T> = core::result::Result<T, Error>;

impl From<ExceptionResponse> for [u8; 2] {
    fn from(ex: ExceptionResponse) -> [u8; 2] {
        let fn_code = ex.function.value();
        debug_assert!(fn_code < 0x80);
        [ex.function.exception_value(), ex.exception as u8]
    }
}

impl<'r> TryFrom<&'r [u8]> for Request<'r> {
    type Error = Error;

    fn try_from(bytes: &'r [u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::BufferSize);
        }

        let fn_code = FunctionCode::new(bytes[0]);

        if bytes.len() < min_request_pdu_len(fn_code) {
            return Err(Error::BufferSize);
        }

        use crate::frame::Request::*;
        use FunctionCode as f;

        let req = match fn_code {
            f::ReadHoldingRegisters | f::ReadInputRegisters | f::WriteSingleRegister => {
                let addr = BigEndian::read_u16(&bytes[1..3]);
                let value = BigEndian::read_u16(&bytes[3..5]);
                match fn_code {
                    f::ReadHoldingRegisters => ReadHoldingRegisters(addr, value),
                    f::ReadInputRegisters => ReadInputRegisters(addr, value),
                    _ => WriteSingleRegister(addr, value),
                }
            }
            f::WriteMultipleRegisters => {
                let address = BigEndian::read_u16(&bytes[1..3]);
                let quantity = BigEndian::read_u16(&bytes[3..5]) as usize;
                let byte_count = bytes[5];
                if bytes.len() < (6 + byte_count as usize) || quantity * 2 != byte_count as usize {
                    return Err(Error::ByteCount(byte_count));
                }
                let data = Data {
                    quantity,
                    data: &bytes[6..6 + byte_count as usize],
                };
                WriteMultipleRegisters(address, data)
            }
            _ => match fn_code.value() {
                code if code < 0x80 => Custom(fn_code, &bytes[1..]),
                code => return Err(Error::FnCode(code)),
            },
        };
        Ok(req)
    }
}

const fn min_request_pdu_len(fn_code: FunctionCode) -> usize {
    use FunctionCode::*;
    match fn_code {
        ReadHoldingRegisters | ReadInputRegisters | WriteSingleRegister => 5,
        WriteMultipleRegisters => 6,
        _ => 1,
    }
}
