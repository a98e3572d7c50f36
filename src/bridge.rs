// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus TCP to RTU bridge
//!
//! Forwards one transaction at a time from a TCP client to the RTU
//! segment. RTU responses are delimited by bus silence, checked against the
//! pending request and, if that fails, handed to the configured
//! [`FrameRecoveryPolicy`] before being dropped.

use crate::{
    codec::{
        rtu::{self, CRC_LEN, SlaveId, extract_frame, response_pdu_len, write_crc},
        tcp::{
            self,
            server::{decode_request, encode_exception, encode_response},
        },
    },
    error::Error,
    frame::{Exception, ExceptionResponse, FrameLocation, FunctionCode},
    recovery::{FrameRecoveryPolicy, Outcome, Recovery},
    timebase::{Tick, Timebase, elapsed},
};

/// Inter-frame silence used above 19200 baud.
pub const FIXED_INTER_FRAME_TIME_US: u32 = 1750;

/// Standard 3.5 character silence of an 11 bit character.
#[must_use]
pub const fn standard_inter_frame_time_us(baud_rate: u32) -> u32 {
    if baud_rate == 0 || baud_rate > 19200 {
        return FIXED_INTER_FRAME_TIME_US;
    }
    // 11 bits * 3.5 * 1_000_000 us
    38_500_000 / baud_rate
}

#[cfg_attr(all(feature = "defmt", target_os = "none"), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    pub baud_rate: u32,
    /// Overrides the standard inter-frame silence.
    pub inter_frame_time_us: Option<u32>,
    pub recovery: FrameRecoveryPolicy,
    pub response_timeout_ms: u32,
}

impl BridgeConfig {
    pub const DEFAULT: Self = Self {
        baud_rate: 19200,
        inter_frame_time_us: None,
        recovery: FrameRecoveryPolicy::None,
        response_timeout_ms: 1000,
    };

    /// Sofar inverters pause longer than 3.5 characters within a frame
    /// and corrupt responses at the bus turnaround.
    pub const SOFAR: Self = Self {
        baud_rate: 9600,
        inter_frame_time_us: Some(8000),
        recovery: FrameRecoveryPolicy::SofarV2,
        response_timeout_ms: 1000,
    };

    #[must_use]
    pub const fn inter_frame_time_us(&self) -> u32 {
        match self.inter_frame_time_us {
            Some(us) => us,
            None => standard_inter_frame_time_us(self.baud_rate),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Convert a duration into ticks, rounding up to at least one tick.
const fn to_ticks(duration: u32, units_per_second: u32, ticks_per_second: u32) -> Tick {
    let ticks = (duration as u64 * ticks_per_second as u64).div_ceil(units_per_second as u64);
    if ticks == 0 {
        1
    } else if ticks > Tick::MAX as u64 {
        Tick::MAX
    } else {
        ticks as Tick
    }
}

/// Collects RTU bytes into frames delimited by bus silence.
#[derive(Debug, Clone)]
pub struct RtuReceiver {
    buf: [u8; rtu::MAX_FRAME_LEN],
    len: usize,
    overrun: bool,
    last_byte: Tick,
    silence: Tick,
}

impl RtuReceiver {
    /// A frame ends after `silence` ticks without a byte.
    #[must_use]
    pub const fn new(silence: Tick) -> Self {
        Self {
            buf: [0; rtu::MAX_FRAME_LEN],
            len: 0,
            overrun: false,
            last_byte: 0,
            silence,
        }
    }

    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.len == 0 && !self.overrun
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.overrun = false;
    }

    /// Append a received byte.
    ///
    /// A completed frame that hasn't been taken yet is discarded.
    pub fn push(&mut self, byte: u8, now: Tick) {
        if !self.is_idle() && elapsed(now, self.last_byte) >= self.silence {
            #[cfg(feature = "log")]
            log::warn!("Discard uncollected RTU frame of {} bytes", self.len);
            self.clear();
        }
        self.last_byte = now;
        if self.len < self.buf.len() {
            self.buf[self.len] = byte;
            self.len += 1;
        } else {
            self.overrun = true;
        }
    }

    /// Move a completed frame into `out`, returning its length.
    ///
    /// Frames exceeding the maximum RTU frame size or `out` are dropped.
    pub fn take(&mut self, now: Tick, out: &mut [u8]) -> Option<usize> {
        if self.is_idle() || elapsed(now, self.last_byte) < self.silence {
            return None;
        }
        let len = self.len;
        let overrun = self.overrun;
        self.clear();
        if overrun || out.len() < len {
            #[cfg(feature = "log")]
            log::warn!("Drop oversized RTU frame");
            return None;
        }
        out[..len].copy_from_slice(&self.buf[..len]);
        Some(len)
    }
}

/// Bridge counters, wrapping.
#[cfg_attr(all(feature = "defmt", target_os = "none"), derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub requests: u32,
    pub responses: u32,
    pub recovered: u32,
    pub dropped: u32,
    pub timeouts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    hdr: tcp::Header,
    function: FunctionCode,
    sent_at: Tick,
}

impl Pending {
    const fn slave(&self) -> SlaveId {
        self.hdr.unit_id
    }
}

#[derive(Debug)]
pub struct Bridge<T> {
    timebase: T,
    recovery: FrameRecoveryPolicy,
    response_timeout: Tick,
    receiver: RtuReceiver,
    pending: Option<Pending>,
    stats: BridgeStats,
}

impl<T: Timebase> Bridge<T> {
    pub fn new(config: BridgeConfig, timebase: T) -> Self {
        let ticks_per_second = timebase.ticks_per_second();
        let silence = to_ticks(config.inter_frame_time_us(), 1_000_000, ticks_per_second);
        let response_timeout = to_ticks(config.response_timeout_ms, 1000, ticks_per_second);
        Self {
            timebase,
            recovery: config.recovery,
            response_timeout,
            receiver: RtuReceiver::new(silence),
            pending: None,
            stats: BridgeStats::default(),
        }
    }

    #[must_use]
    pub const fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Feed a byte received from the RTU segment.
    pub fn receive(&mut self, byte: u8) {
        let now = self.timebase.now();
        self.receiver.push(byte, now);
    }

    /// Translate a TCP request into an RTU frame in `rtu_out`.
    ///
    /// Returns `None` while the TCP request is incomplete. Broadcasts
    /// (unit id 0) are forwarded without waiting for a response.
    pub fn forward_request(
        &mut self,
        tcp: &[u8],
        rtu_out: &mut [u8],
    ) -> Result<Option<usize>, Error> {
        let Some((hdr, pdu)) = decode_request(tcp)? else {
            return Ok(None);
        };
        if self.pending.is_some() {
            return Err(Error::TransactionPending);
        }
        let code = pdu[0];
        if code >= 0x80 {
            return Err(Error::FnCode(code));
        }
        let len = 1 + pdu.len();
        if rtu_out.len() < len {
            return Err(Error::BufferSize);
        }
        rtu_out[0] = hdr.unit_id;
        rtu_out[1..len].copy_from_slice(pdu);
        let len = write_crc(rtu_out, len)?;

        // Bytes received so far can't belong to the response
        self.receiver.clear();
        self.stats.requests = self.stats.requests.wrapping_add(1);
        if hdr.unit_id != rtu::BROADCAST_SLAVE_ID {
            self.pending = Some(Pending {
                hdr,
                function: FunctionCode::new(code),
                sent_at: self.timebase.now(),
            });
        }
        Ok(Some(len))
    }

    /// Translate the RTU response `frame` into a TCP response in `tcp_out`.
    ///
    /// The frame is repaired in place if needed. Returns `None` if the frame
    /// was dropped; the transaction then stays pending until it times out.
    pub fn forward_response(
        &mut self,
        frame: &mut [u8],
        tcp_out: &mut [u8],
    ) -> Result<Option<usize>, Error> {
        let pending = self.pending.ok_or(Error::NoPendingTransaction)?;
        let window = match validate_response(frame, &pending) {
            Some(window) => window,
            None => {
                let window = FrameLocation {
                    start: 1,
                    size: frame.len().saturating_sub(1 + CRC_LEN),
                };
                let Recovery { window, outcome } =
                    self.recovery.recover(pending.slave(), pending.function, frame, window);
                match outcome {
                    Outcome::Recovered { .. } => {
                        self.stats.recovered = self.stats.recovered.wrapping_add(1);
                        window
                    }
                    Outcome::Unrecoverable => {
                        self.stats.dropped = self.stats.dropped.wrapping_add(1);
                        return Ok(None);
                    }
                }
            }
        };
        let len = encode_response(pending.hdr, window.slice(frame), tcp_out)?;
        self.pending = None;
        self.stats.responses = self.stats.responses.wrapping_add(1);
        Ok(Some(len))
    }

    /// Answer the pending transaction with a gateway exception.
    pub fn on_timeout(&mut self, tcp_out: &mut [u8]) -> Result<usize, Error> {
        let pending = self.pending.ok_or(Error::NoPendingTransaction)?;
        #[cfg(feature = "log")]
        log::warn!(
            "Node {} did not respond to transaction {}",
            pending.slave(),
            pending.hdr.transaction_id
        );
        let ex = ExceptionResponse {
            function: pending.function,
            exception: Exception::GatewayTargetDevice,
        };
        let len = encode_exception(pending.hdr, ex, tcp_out)?;
        self.pending = None;
        self.stats.timeouts = self.stats.timeouts.wrapping_add(1);
        Ok(len)
    }

    /// Handle received frames and timeouts.
    ///
    /// Returns the length of a TCP response written to `tcp_out`.
    pub fn poll(&mut self, tcp_out: &mut [u8]) -> Result<Option<usize>, Error> {
        let now = self.timebase.now();
        let mut frame = [0; rtu::MAX_FRAME_LEN];
        if let Some(len) = self.receiver.take(now, &mut frame) {
            return match self.forward_response(&mut frame[..len], tcp_out) {
                Err(Error::NoPendingTransaction) => {
                    #[cfg(feature = "log")]
                    log::warn!("Drop unsolicited RTU frame of {len} bytes");
                    self.stats.dropped = self.stats.dropped.wrapping_add(1);
                    Ok(None)
                }
                result => result,
            };
        }
        match self.pending {
            Some(pending) if elapsed(now, pending.sent_at) >= self.response_timeout => {
                self.on_timeout(tcp_out).map(Some)
            }
            _ => Ok(None),
        }
    }
}

/// The PDU window of `frame` if it is an intact response to `pending`.
fn validate_response(frame: &[u8], pending: &Pending) -> Option<FrameLocation> {
    let pdu_len = response_pdu_len(frame).ok()??;
    if frame.len() != 1 + pdu_len + CRC_LEN {
        return None;
    }
    let decoded = extract_frame(frame, pdu_len).ok()??;
    let function = decoded.pdu[0];
    if decoded.slave != pending.slave()
        || (function != pending.function.value() && function != pending.function.exception_value())
    {
        return None;
    }
    Some(FrameLocation {
        start: 1,
        size: pdu_len,
    })
}
