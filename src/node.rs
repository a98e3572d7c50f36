// SPDX-FileCopyrightText: Copyright (c) 2018-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTU sensor node
//!
//! Glues the [`Integrator`], the [`CalibrationStore`] and the [`RegisterMap`]
//! to an RTU request/response cycle. The serial transport hands over one
//! silence-delimited frame at a time and sends whatever is returned.

use crate::{
    adc::Adc,
    calibration::{Calibration, CalibrationStore, NvStorage},
    codec::rtu::{
        BROADCAST_SLAVE_ID, CRC_LEN, Header, RequestAdu, ResponseAdu, SlaveId, extract_frame,
        server::{decode_request, encode_response},
    },
    error::Error,
    frame::{
        Data, Exception, ExceptionResponse, FunctionCode, Quantity, Request, RequestPdu, Response,
        ResponsePdu,
    },
    integrator::{CHANNELS, Integrator, IntegratorConfig},
    registers::{RegisterMap, ResetReason, SensorLayout, SystemStatus},
    timebase::Timebase,
};

/// Largest register payload of a single read response.
const MAX_READ_BYTES: usize = 250;

/// Platform services of the node.
pub trait System {
    /// Restart the device, recording `reason` for the next boot.
    fn fatal(&mut self, reason: ResetReason) -> !;
}

#[derive(Debug)]
pub struct SensorNode<A, T, S, const N: usize = CHANNELS> {
    slave: SlaveId,
    integrator: Integrator<A, T, N>,
    store: CalibrationStore<S, N>,
    registers: RegisterMap<N>,
}

impl<A, T, S, const N: usize> SensorNode<A, T, S, N>
where
    A: Adc,
    T: Timebase,
    S: NvStorage,
{
    /// Load the persisted calibration and start acquisition.
    pub fn new(
        slave: SlaveId,
        adc: A,
        timebase: T,
        config: IntegratorConfig,
        mut store: CalibrationStore<S, N>,
        reset_reason: ResetReason,
    ) -> Self {
        let calibration = store.load();
        #[cfg(feature = "log")]
        log::info!(
            "Node {slave} started ({reset_reason:?}), calibration {:?}",
            calibration.scalars()
        );
        Self {
            slave,
            integrator: Integrator::new(adc, timebase, config, &calibration),
            store,
            registers: RegisterMap::new(SensorLayout::from(config.mode), reset_reason),
        }
    }

    #[must_use]
    pub const fn slave(&self) -> SlaveId {
        self.slave
    }

    #[must_use]
    pub const fn integrator(&self) -> &Integrator<A, T, N> {
        &self.integrator
    }

    #[must_use]
    pub const fn status(&self) -> &SystemStatus {
        self.registers.status()
    }

    #[must_use]
    pub fn calibration(&self) -> Calibration<N> {
        self.integrator.calibration()
    }

    /// Persist a new calibration and apply it to the running integrator.
    pub fn set_calibration(&mut self, calibration: &Calibration<N>) {
        self.store.write(calibration);
        self.integrator.set_calibration(calibration);
    }

    /// Advance acquisition, see [`Integrator::poll`].
    pub fn poll(&mut self) -> Result<(), Error> {
        self.integrator.poll()
    }

    /// Handle one received RTU frame.
    ///
    /// Returns the length of the response written to `out`, or `None` if
    /// the frame must not be answered: foreign slave id, broadcast, or a
    /// corrupted frame (counted as CRC error). Intact frames that can't be
    /// decoded are answered with an exception.
    pub fn process(&mut self, frame: &[u8], out: &mut [u8]) -> Result<Option<usize>, Error> {
        let adu = match decode_request(frame) {
            Ok(Some(adu)) => adu,
            Ok(None) => return Ok(None),
            Err(Error::Crc(_expected, _actual)) => {
                #[cfg(feature = "log")]
                log::warn!("Dropped frame: CRC 0x{_expected:0>4X} != 0x{_actual:0>4X}");
                self.registers.status_mut().record_crc_error();
                return Ok(None);
            }
            Err(Error::FnCode(code)) => {
                return self.reject(frame, code, Exception::IllegalFunction, out);
            }
            Err(Error::ByteCount(_) | Error::BufferSize) => {
                let code = frame.get(1).copied().unwrap_or_default();
                return self.reject(frame, code, Exception::IllegalDataValue, out);
            }
            Err(err) => return Err(err),
        };
        let RequestAdu {
            hdr,
            pdu: RequestPdu(request),
        } = adu;
        let broadcast = hdr.slave == BROADCAST_SLAVE_ID;
        if !broadcast && hdr.slave != self.slave {
            return Ok(None);
        }
        let mut scratch = [0; MAX_READ_BYTES];
        let result = self.dispatch(request, broadcast, &mut scratch)?;
        if broadcast {
            return Ok(None);
        }
        let pdu = ResponsePdu(result.map_err(|exception| {
            #[cfg(feature = "log")]
            log::debug!("Reject {request:?}: {exception}");
            ExceptionResponse {
                function: FunctionCode::from(request),
                exception,
            }
        }));
        self.respond(pdu, out).map(Some)
    }

    fn dispatch<'s>(
        &mut self,
        request: Request<'_>,
        broadcast: bool,
        scratch: &'s mut [u8],
    ) -> Result<Result<Response<'s>, Exception>, Error> {
        let function = FunctionCode::from(request);
        let Some((address, count)) = request.registers() else {
            return Ok(Err(Exception::IllegalFunction));
        };
        if let Err(exception) = self.registers.validate(address, count, function) {
            return Ok(Err(exception));
        }
        let response = match request {
            // Never consume a snapshot for a read nobody answers
            Request::ReadHoldingRegisters(..) if broadcast => {
                return Ok(Err(Exception::IllegalFunction));
            }
            Request::ReadHoldingRegisters(address, _) => {
                let len = self
                    .registers
                    .on_send(address, &mut self.integrator, scratch)?;
                Response::ReadHoldingRegisters(Data::from_bytes(&scratch[..len])?)
            }
            Request::WriteSingleRegister(address, value) => {
                let mut bytes = [0; 2];
                let data = Data::from_words(&[value], &mut bytes)?;
                if !self.registers.on_receive(address, data) {
                    return Ok(Err(Exception::IllegalDataAddress));
                }
                Response::WriteSingleRegister(address, value)
            }
            Request::WriteMultipleRegisters(address, data) => {
                if !self.registers.on_receive(address, data) {
                    return Ok(Err(Exception::IllegalDataAddress));
                }
                Response::WriteMultipleRegisters(address, data.len() as Quantity)
            }
            Request::ReadInputRegisters(..) | Request::Custom(..) => {
                return Ok(Err(Exception::IllegalFunction));
            }
        };
        Ok(Ok(response))
    }

    /// Answer an intact frame that could not be decoded with `exception`.
    ///
    /// Covers unsupported function codes and malformed PDUs; anything that
    /// fails the CRC is counted instead.
    fn reject(
        &mut self,
        frame: &[u8],
        code: u8,
        exception: Exception,
        out: &mut [u8],
    ) -> Result<Option<usize>, Error> {
        if frame.len() < 2 + CRC_LEN || code >= 0x80 {
            return Ok(None);
        }
        let pdu_len = frame.len() - 1 - CRC_LEN;
        match extract_frame(frame, pdu_len) {
            Ok(Some(decoded)) if decoded.slave == self.slave => {
                let pdu = ResponsePdu(Err(ExceptionResponse {
                    function: FunctionCode::new(code),
                    exception,
                }));
                self.respond(pdu, out).map(Some)
            }
            Ok(_) => Ok(None),
            Err(_) => {
                self.registers.status_mut().record_crc_error();
                Ok(None)
            }
        }
    }

    fn respond(&self, pdu: ResponsePdu<'_>, out: &mut [u8]) -> Result<usize, Error> {
        let adu = ResponseAdu {
            hdr: Header { slave: self.slave },
            pdu,
        };
        encode_response(adu, out)
    }
}

/// Cooperative main loop of the node.
///
/// Runs `tasks` (watchdog, serial transport, ...) and one acquisition step
/// per iteration. A missed acquisition deadline restarts the device through
/// [`System::fatal`].
pub fn run<A, T, S, Y, F, const N: usize>(
    node: &mut SensorNode<A, T, S, N>,
    system: &mut Y,
    mut tasks: F,
) -> !
where
    A: Adc,
    T: Timebase,
    S: NvStorage,
    Y: System,
    F: FnMut(&mut SensorNode<A, T, S, N>),
{
    loop {
        tasks(node);
        if let Err(_err) = node.poll() {
            #[cfg(feature = "log")]
            log::error!("Fatal: {_err}");
            system.fatal(ResetReason::DeadlineMissed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adc::{Sample, sim::SimulatedAdc},
        calibration::{NEUTRAL, sim::RamStorage},
        codec::rtu::{crc16, write_crc},
        timebase::sim::ManualClock,
    };
    use byteorder::{BigEndian, ByteOrder};

    const SLAVE: SlaveId = 0x05;
    const PERIOD: u32 = 125;

    type TestNode<'a> = SensorNode<SimulatedAdc<2>, &'a ManualClock, &'a mut RamStorage, 2>;

    fn node<'a>(
        clock: &'a ManualClock,
        storage: &'a mut RamStorage,
        sequences: [&'static [Sample]; 2],
        config: IntegratorConfig,
    ) -> TestNode<'a> {
        SensorNode::new(
            SLAVE,
            SimulatedAdc::new(sequences),
            clock,
            config,
            CalibrationStore::new(storage, 0),
            ResetReason::PowerOn,
        )
    }

    fn frame(adu: &[u8]) -> Vec<u8> {
        let mut buf = adu.to_vec();
        buf.extend_from_slice(&[0, 0]);
        write_crc(&mut buf, adu.len()).unwrap();
        buf
    }

    /// Process `request` and return the response without its (checked) CRC.
    fn request(node: &mut TestNode<'_>, adu: &[u8]) -> Option<Vec<u8>> {
        let out = &mut [0; 256];
        let len = node.process(&frame(adu), out).unwrap()?;
        let (adu, crc) = out[..len].split_at(len - 2);
        assert_eq!(crc16(adu), BigEndian::read_u16(crc));
        Some(adu.to_vec())
    }

    fn sample(node: &mut TestNode<'_>, clock: &ManualClock, n: usize) {
        for _ in 0..n {
            clock.advance(PERIOD);
            node.poll().unwrap();
            node.poll().unwrap();
        }
    }

    #[test]
    fn read_system_block() {
        let clock = ManualClock::new(1000);
        let mut storage = RamStorage::erased();
        let mut node = node(&clock, &mut storage, [&[0], &[0]], IntegratorConfig::DEFAULT);
        let rsp = request(&mut node, &[SLAVE, 0x03, 0x00, 0x00, 0x00, 0x02]).unwrap();
        assert_eq!(rsp, [SLAVE, 0x03, 0x04, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn count_crc_errors() {
        let clock = ManualClock::new(1000);
        let mut storage = RamStorage::erased();
        let mut node = node(&clock, &mut storage, [&[0], &[0]], IntegratorConfig::DEFAULT);
        let mut corrupted = frame(&[SLAVE, 0x03, 0x00, 0x00, 0x00, 0x02]);
        corrupted[3] ^= 0x40;
        for _ in 0..3 {
            assert_eq!(node.process(&corrupted, &mut [0; 32]), Ok(None));
        }
        assert_eq!(node.status().crc_errors, 3);
        let rsp = request(&mut node, &[SLAVE, 0x03, 0x00, 0x00, 0x00, 0x02]).unwrap();
        assert_eq!(&rsp[3..], &[0x01, 0x00, 0x03, 0x00]);
    }

    #[test]
    fn ignore_other_slaves() {
        let clock = ManualClock::new(1000);
        let mut storage = RamStorage::erased();
        let mut node = node(&clock, &mut storage, [&[0], &[0]], IntegratorConfig::DEFAULT);
        assert_eq!(request(&mut node, &[0x06, 0x03, 0x00, 0x00, 0x00, 0x02]), None);
        assert_eq!(request(&mut node, &[0x06, 0x2B, 0x0E, 0x01, 0x00]), None);
    }

    #[test]
    fn read_sensor_block() {
        let clock = ManualClock::new(1000);
        let mut storage = RamStorage::erased();
        let mut node = node(&clock, &mut storage, [&[100], &[200]], IntegratorConfig::DEFAULT);
        sample(&mut node, &clock, 8);
        let read = [SLAVE, 0x03, 0x02, 0x00, 0x00, 0x04];
        let rsp = request(&mut node, &read).unwrap();
        assert_eq!(
            rsp,
            [SLAVE, 0x03, 0x08, 0x00, 0x00, 0x00, 0x64, 0x00, 0x00, 0x00, 0xC8]
        );
        let rsp = request(&mut node, &read).unwrap();
        assert_eq!(&rsp[3..], &[0; 8]);
    }

    #[test]
    fn read_accumulated_sensor_block() {
        let clock = ManualClock::new(1000);
        let mut storage = RamStorage::erased();
        let mut node = node(&clock, &mut storage, [&[1000], &[3]], IntegratorConfig::ACCUMULATING);
        sample(&mut node, &clock, 5);
        let rsp = request(&mut node, &[SLAVE, 0x03, 0x02, 0x00, 0x00, 0x06]).unwrap();
        assert_eq!(
            rsp,
            [
                SLAVE, 0x03, 0x0C, //
                0x0B, 0xB8, 0x00, 0x00, 0x00, 0x03, //
                0x00, 0x06, 0x00, 0x00, 0x00, 0x02,
            ]
        );
    }

    #[test]
    fn exception_responses() {
        let clock = ManualClock::new(1000);
        let mut storage = RamStorage::erased();
        let mut node = node(&clock, &mut storage, [&[0], &[0]], IntegratorConfig::DEFAULT);
        // Wrong count
        let rsp = request(&mut node, &[SLAVE, 0x03, 0x00, 0x00, 0x00, 0x03]).unwrap();
        assert_eq!(rsp, [SLAVE, 0x83, 0x03]);
        // Unknown address
        let rsp = request(&mut node, &[SLAVE, 0x03, 0x01, 0x00, 0x00, 0x02]).unwrap();
        assert_eq!(rsp, [SLAVE, 0x83, 0x02]);
        // Read only block
        let rsp = request(
            &mut node,
            &[
                SLAVE, 0x10, 0x02, 0x00, 0x00, 0x04, 0x08, 0, 0, 0, 0, 0, 0, 0, 0,
            ],
        )
        .unwrap();
        assert_eq!(rsp, [SLAVE, 0x90, 0x01]);
        // Input registers aren't mapped
        let rsp = request(&mut node, &[SLAVE, 0x04, 0x02, 0x00, 0x00, 0x04]).unwrap();
        assert_eq!(rsp, [SLAVE, 0x84, 0x01]);
        // Coils aren't supported at all
        let rsp = request(&mut node, &[SLAVE, 0x01, 0x00, 0x00, 0x00, 0x08]).unwrap();
        assert_eq!(rsp, [SLAVE, 0x81, 0x01]);
        // Unknown function code
        let rsp = request(&mut node, &[SLAVE, 0x2B, 0x0E, 0x01, 0x00]).unwrap();
        assert_eq!(rsp, [SLAVE, 0xAB, 0x01]);
        assert_eq!(node.status().crc_errors, 0);
    }

    #[test]
    fn malformed_write_is_illegal_data_value() {
        let clock = ManualClock::new(1000);
        let mut storage = RamStorage::erased();
        let mut node = node(&clock, &mut storage, [&[0], &[0]], IntegratorConfig::DEFAULT);
        // Byte count 2 doesn't match a quantity of 2 registers
        let write = [SLAVE, 0x10, 0x00, 0x00, 0x00, 0x02, 0x02, 0xAA, 0xBB];
        let rsp = request(&mut node, &write).unwrap();
        assert_eq!(rsp, [SLAVE, 0x90, 0x03]);
        assert_eq!(node.status().crc_errors, 0);
        // Other slaves and broadcasts stay silent
        let mut foreign = write;
        foreign[0] = SLAVE + 1;
        assert_eq!(request(&mut node, &foreign), None);
        foreign[0] = 0x00;
        assert_eq!(request(&mut node, &foreign), None);
    }

    #[test]
    fn write_resets_system_block() {
        let clock = ManualClock::new(1000);
        let mut storage = RamStorage::erased();
        let mut node = node(&clock, &mut storage, [&[0], &[0]], IntegratorConfig::DEFAULT);
        let mut corrupted = frame(&[SLAVE, 0x03, 0x00, 0x00, 0x00, 0x02]);
        corrupted[7] ^= 0x01;
        node.process(&corrupted, &mut [0; 32]).unwrap();
        let write = [SLAVE, 0x10, 0x00, 0x00, 0x00, 0x02, 0x04, 0xFF, 0xFF, 0xFF, 0xFF];
        let rsp = request(&mut node, &write).unwrap();
        assert_eq!(rsp, [SLAVE, 0x10, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(*node.status(), SystemStatus::default());
    }

    #[test]
    fn broadcast_write_is_applied_silently() {
        let clock = ManualClock::new(1000);
        let mut storage = RamStorage::erased();
        let mut node = node(&clock, &mut storage, [&[0], &[0]], IntegratorConfig::DEFAULT);
        let write = [0x00, 0x10, 0x00, 0x00, 0x00, 0x02, 0x04, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(request(&mut node, &write), None);
        assert_eq!(node.status().reset_reason, ResetReason::None);
        // Broadcast reads are neither answered nor do they consume data
        assert_eq!(request(&mut node, &[0x00, 0x03, 0x00, 0x00, 0x00, 0x02]), None);
    }

    #[test]
    fn broadcast_read_keeps_snapshot() {
        let clock = ManualClock::new(1000);
        let mut storage = RamStorage::erased();
        let mut node = node(&clock, &mut storage, [&[1], &[1]], IntegratorConfig::ACCUMULATING);
        sample(&mut node, &clock, 2);
        assert_eq!(request(&mut node, &[0x00, 0x03, 0x02, 0x00, 0x00, 0x06]), None);
        let rsp = request(&mut node, &[SLAVE, 0x03, 0x02, 0x00, 0x00, 0x06]).unwrap();
        assert_eq!(&rsp[3..9], &[0x00, 0x01, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn calibration_survives_restart() {
        let clock = ManualClock::new(1000);
        let mut storage = RamStorage::erased();
        let calibration = Calibration::from_scalars([NEUTRAL / 2, NEUTRAL]);
        {
            let mut node = node(&clock, &mut storage, [&[64], &[64]], IntegratorConfig::DEFAULT);
            assert_eq!(node.calibration(), Calibration::neutral());
            node.set_calibration(&calibration);
            assert_eq!(node.calibration(), calibration);
            sample(&mut node, &clock, 8);
            let rsp = request(&mut node, &[SLAVE, 0x03, 0x02, 0x00, 0x00, 0x04]).unwrap();
            // 32.0 and 64.0
            assert_eq!(&rsp[3..], &[0, 0, 0, 0x20, 0, 0, 0, 0x40]);
        }
        let node = node(&clock, &mut storage, [&[64], &[64]], IntegratorConfig::DEFAULT);
        assert_eq!(node.calibration(), calibration);
    }

    struct RestartingSystem;

    impl System for RestartingSystem {
        fn fatal(&mut self, reason: ResetReason) -> ! {
            panic!("restart: {reason:?}");
        }
    }

    #[test]
    #[should_panic(expected = "restart: DeadlineMissed")]
    fn run_restarts_on_missed_deadline() {
        let clock = ManualClock::new(1000);
        let mut storage = RamStorage::erased();
        let mut node = node(
            &clock,
            &mut storage,
            [&[0xFFFF], &[0xFFFF]],
            IntegratorConfig::ACCUMULATING,
        );
        run(&mut node, &mut RestartingSystem, |_| clock.advance(PERIOD / 2));
    }
}
