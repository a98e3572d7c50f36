// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Repair of RTU responses corrupted by bus arbitration
//!
//! Some inverters switch their RS-485 driver late or early, which corrupts
//! the first bytes of a response. Two signatures are known and repaired:
//!
//! * a lone `0x90` in place of the exception function code, optionally
//!   preceded by the node id: the response is rewritten to an exception
//!   of the requested function;
//! * the node id repeated in front of the function code: the whole PDU is
//!   shifted right by one byte.
//!
//! Repairs operate on a [`FrameLocation`] over the transport's receive
//! buffer covering the PDU, i.e. without the address byte and the CRC.

use core::fmt;

use crate::{
    codec::rtu::SlaveId,
    frame::{FrameLocation, FunctionCode},
};

/// Function code byte observed in place of the real exception code.
const SENTINEL: u8 = 0x90;

/// Maximum number of bytes in a diagnostic dump.
const DUMP_LIMIT: usize = 64;

/// Vendor specific repair strategy, chosen at configuration time.
#[cfg_attr(all(feature = "defmt", target_os = "none"), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRecoveryPolicy {
    /// Never repair.
    None,
    /// Rewrites the sentinel to `0x83`, which is only correct for
    /// `ReadHoldingRegisters` requests.
    SofarV1,
    /// Rewrites the sentinel to the exception code of the request.
    SofarV2,
}

#[cfg_attr(all(feature = "defmt", target_os = "none"), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The window now holds a valid PDU of `slave`.
    Recovered { slave: SlaveId },
    /// No known signature, the buffer is untouched.
    Unrecoverable,
}

/// Result of [`FrameRecoveryPolicy::recover`].
#[cfg_attr(all(feature = "defmt", target_os = "none"), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recovery {
    pub window: FrameLocation,
    pub outcome: Outcome,
}

impl Recovery {
    #[must_use]
    pub const fn is_recovered(&self) -> bool {
        matches!(self.outcome, Outcome::Recovered { .. })
    }
}

impl FrameRecoveryPolicy {
    /// Try to repair the PDU at `window` in `buf` of a response to a
    /// `function` request sent to `node_id`.
    ///
    /// Only the sentinel repair writes to `buf`. The returned window covers
    /// the repaired PDU, or equals `window` if nothing matched.
    pub fn recover(
        self,
        node_id: SlaveId,
        function: FunctionCode,
        buf: &mut [u8],
        window: FrameLocation,
    ) -> Recovery {
        let unrecoverable = Recovery {
            window,
            outcome: Outcome::Unrecoverable,
        };
        let exception_code = match self {
            Self::None => return unrecoverable,
            Self::SofarV1 => {
                #[cfg(feature = "log")]
                if function != FunctionCode::ReadHoldingRegisters {
                    log::warn!("Sentinel repair assumes function 0x03, request was {function}");
                }
                0x83
            }
            Self::SofarV2 => function.exception_value(),
        };
        if window.size < 2 || window.end() > buf.len() {
            log_invalid(buf, window);
            return unrecoverable;
        }

        let mut repaired = window;
        if repaired.size == 3 && buf[repaired.start + 1] == SENTINEL {
            repaired = repaired.shift_left();
        }
        let recovered = Recovery {
            window: repaired,
            outcome: Outcome::Recovered { slave: node_id },
        };
        let pdu = repaired.slice_mut(buf);
        if pdu.len() == 2 && pdu[0] == SENTINEL {
            pdu[0] = exception_code;
            #[cfg(feature = "log")]
            log::info!("Recovered 0x{SENTINEL:0>2X} error of node {node_id}");
            return recovered;
        }
        if pdu[0] == node_id && pdu[1] == function.value() {
            #[cfg(feature = "log")]
            log::info!("Recovered 1-byte shifted frame of node {node_id}");
            return Recovery {
                window: repaired.shift_left(),
                ..recovered
            };
        }
        log_invalid(buf, window);
        unrecoverable
    }
}

#[cfg_attr(not(feature = "log"), allow(unused_variables))]
fn log_invalid(buf: &[u8], window: FrameLocation) {
    #[cfg(feature = "log")]
    {
        // Include the CRC trailer
        let start = window.start.min(buf.len());
        let end = (window.end() + crate::codec::rtu::CRC_LEN).min(buf.len());
        log::warn!("Invalid RTU frame: {}", HexDump(&buf[start..end]));
    }
}

/// Renders bytes as `<xx>` each, truncated with `...` after 64 bytes.
#[derive(Debug, Clone, Copy)]
pub struct HexDump<'a>(pub &'a [u8]);

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().take(DUMP_LIMIT) {
            write!(f, "<{byte:0>2x}>")?;
        }
        if self.0.len() > DUMP_LIMIT {
            write!(f, "...")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::rtu::CRC_LEN;

    const NODE: SlaveId = 0x05;
    const READ: FunctionCode = FunctionCode::ReadHoldingRegisters;

    /// The PDU window of a received RTU frame `buf`.
    fn pdu_window(buf: &[u8]) -> FrameLocation {
        FrameLocation {
            start: 1,
            size: buf.len() - 1 - CRC_LEN,
        }
    }

    #[test]
    fn repair_sentinel() {
        let buf = &mut [NODE, 0x90, 0x00, 0xAA, 0xBB];
        let window = pdu_window(buf);
        let recovery = FrameRecoveryPolicy::SofarV2.recover(NODE, READ, buf, window);
        assert_eq!(recovery.outcome, Outcome::Recovered { slave: 0x05 });
        assert_eq!(recovery.window, FrameLocation { start: 1, size: 2 });
        assert_eq!(recovery.window.slice(buf), &[0x83, 0x00]);
    }

    #[test]
    fn repair_shifted_sentinel() {
        let buf = &mut [0xFF, NODE, 0x90, 0x00, 0xAA, 0xBB];
        let window = pdu_window(buf);
        let recovery = FrameRecoveryPolicy::SofarV2.recover(NODE, READ, buf, window);
        assert_eq!(recovery.outcome, Outcome::Recovered { slave: 0x05 });
        assert_eq!(recovery.window, FrameLocation { start: 2, size: 2 });
        assert_eq!(recovery.window.slice(buf), &[0x83, 0x00]);
    }

    #[test]
    fn repair_shifted_frame() {
        let buf = &mut [0x00, NODE, 0x03, 0x04, 0x12, 0x34, 0x56, 0x78, 0xAA, 0xBB];
        let window = pdu_window(buf);
        let recovery = FrameRecoveryPolicy::SofarV2.recover(NODE, READ, buf, window);
        assert_eq!(recovery.outcome, Outcome::Recovered { slave: 0x05 });
        assert_eq!(recovery.window.size, window.size - 1);
        assert_eq!(recovery.window.slice(buf), &[0x03, 0x04, 0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn leave_unknown_corruption_untouched() {
        let original = [NODE, 0x07, 0x03, 0x02, 0x00, 0xAA, 0xBB];
        let mut received = original;
        let buf = &mut received;
        let window = pdu_window(buf);
        let recovery = FrameRecoveryPolicy::SofarV2.recover(NODE, READ, buf, window);
        assert_eq!(
            recovery,
            Recovery {
                window,
                outcome: Outcome::Unrecoverable
            }
        );
        assert!(!recovery.is_recovered());
        assert_eq!(received, original);
    }

    #[test]
    fn leave_unmatched_window_untouched() {
        let buf = &mut [0x01, 0x02, 0x03];
        let window = FrameLocation { start: 0, size: 3 };
        let recovery = FrameRecoveryPolicy::SofarV2.recover(NODE, READ, buf, window);
        assert_eq!(recovery.outcome, Outcome::Unrecoverable);
        assert_eq!(recovery.window, window);
        assert_eq!(buf, &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn sentinel_exception_code_follows_request() {
        let buf = &mut [NODE, 0x90, 0x02, 0, 0];
        let window = pdu_window(buf);
        let function = FunctionCode::ReadInputRegisters;
        let recovery = FrameRecoveryPolicy::SofarV2.recover(NODE, function, buf, window);
        assert_eq!(recovery.window.slice(buf), &[0x84, 0x02]);

        let buf = &mut [NODE, 0x90, 0x02, 0, 0];
        let recovery = FrameRecoveryPolicy::SofarV1.recover(NODE, function, buf, window);
        assert!(recovery.is_recovered());
        assert_eq!(recovery.window.slice(buf), &[0x83, 0x02]);
    }

    #[test]
    fn disabled_policy_never_repairs() {
        let buf = &mut [NODE, 0x90, 0x00, 0xAA, 0xBB];
        let window = pdu_window(buf);
        let recovery = FrameRecoveryPolicy::None.recover(NODE, READ, buf, window);
        assert_eq!(recovery.outcome, Outcome::Unrecoverable);
        assert_eq!(buf[1], 0x90);
    }

    #[test]
    fn short_or_foreign_windows() {
        let buf = &mut [NODE, 0x90, 0xAA, 0xBB];
        let window = pdu_window(buf);
        assert!(!FrameRecoveryPolicy::SofarV2.recover(NODE, READ, buf, window).is_recovered());
        let out_of_bounds = FrameLocation { start: 2, size: 8 };
        assert!(!FrameRecoveryPolicy::SofarV2
            .recover(NODE, READ, buf, out_of_bounds)
            .is_recovered());
        // Shift signature of another node
        let buf = &mut [0x00, 0x06, 0x03, 0x02, 0x00, 0x00, 0xAA, 0xBB];
        let window = pdu_window(buf);
        assert!(!FrameRecoveryPolicy::SofarV2.recover(NODE, READ, buf, window).is_recovered());
    }

    #[test]
    fn hex_dump() {
        assert_eq!(HexDump(&[]).to_string(), "");
        assert_eq!(HexDump(&[0x05, 0x9a, 0x00]).to_string(), "<05><9a><00>");
        let bytes = [0xAB; 65];
        let dump = HexDump(&bytes).to_string();
        assert!(dump.ends_with("<ab>..."));
        assert_eq!(dump.len(), 64 * 4 + 3);
        assert_eq!(HexDump(&bytes[..64]).to_string().len(), 64 * 4);
    }
}
