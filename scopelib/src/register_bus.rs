//! The single-request register bus: turns `read_reg`/`write_reg` calls
//! into framed requests, drives retries on timeout, and resyncs the
//! sequence counter when the device reports a fault.
//!
//! Grounded directly in the reference tool's `SerialHandler`: one
//! command outstanding at a time, a 250 ms retry deadline, and a
//! sequence counter that the *device* advances (the host adopts
//! whatever sequence the device echoes back rather than incrementing
//! its own).

use std::time::{Duration, Instant};

use crate::error::RegisterBusError;
use crate::frame::{self, DeviceFrame, Scan, FLUSH_SENTINEL, STREAM_BULK, STREAM_RESPONSE};
use crate::registers::{Register, RegisterMap};
use crate::transport::Transport;

const REQUEST_DEADLINE: Duration = Duration::from_millis(250);
/// Upper bound on retries for a single request before giving up; the
/// reference tool retries forever, this makes the budget explicit.
const MAX_RETRIES: u32 = 200;

pub struct RegisterBus<T> {
    port: T,
    map: RegisterMap,
    tx_seq: u8,
    rx_seq: u8,
    no_seq_warnings: bool,
    bulk_mode: bool,
    rx_buf: Vec<u8>,
    scratch: [u8; 4096],
    bulk_queue: Vec<Vec<u8>>,
    on_warning: Option<Box<dyn FnMut(String)>>,
}

impl<T: Transport> RegisterBus<T> {
    pub fn new(port: T, map: RegisterMap) -> Self {
        Self {
            port,
            map,
            tx_seq: 0,
            rx_seq: 0,
            no_seq_warnings: false,
            bulk_mode: false,
            rx_buf: Vec::with_capacity(4096),
            scratch: [0u8; 4096],
            bulk_queue: Vec::new(),
            on_warning: None,
        }
    }

    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    pub fn set_warning_sink(&mut self, f: impl FnMut(String) + 'static) {
        self.on_warning = Some(Box::new(f));
    }

    /// Stream-id tag for device frames that aren't register responses
    /// gets routed here instead of being dropped; used while the
    /// sample queue is draining bulk data. Prefer [`crate::sample_queue::BulkModeGuard`]
    /// over calling this directly so the flag is released on every exit path.
    pub fn set_bulk_mode(&mut self, on: bool) {
        self.bulk_mode = on;
    }

    pub fn bulk_mode(&self) -> bool {
        self.bulk_mode
    }

    /// Take ownership of whatever bulk-stream chunks have accumulated
    /// since the last call.
    pub fn drain_bulk(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.bulk_queue)
    }

    /// Pull bytes from the transport and dispatch whatever frames show
    /// up until `deadline` passes, without expecting a specific
    /// register response. Used by the sample-queue wait loop.
    pub fn drain_until(&mut self, deadline: Instant) -> Result<(), RegisterBusError> {
        loop {
            match frame::scan(&self.rx_buf) {
                Scan::NeedMore => {
                    if Instant::now() >= deadline {
                        return Ok(());
                    }
                    let n = self.port.read(&mut self.scratch)?;
                    if n == 0 {
                        continue;
                    }
                    self.rx_buf.extend_from_slice(&self.scratch[..n]);
                }
                Scan::Garbage { consumed } => {
                    self.warn(format!("discarding {consumed} unparseable bytes"));
                    self.rx_buf.drain(..consumed);
                }
                Scan::Frame { consumed, frame } => {
                    self.rx_buf.drain(..consumed);
                    self.dispatch(frame)?;
                }
            }
        }
    }

    fn warn(&mut self, msg: impl Into<String>) {
        if let Some(f) = self.on_warning.as_mut() {
            f(msg.into());
        }
    }

    fn flush_connection(&mut self) -> Result<(), RegisterBusError> {
        self.port.write_all(&FLUSH_SENTINEL)?;
        Ok(())
    }

    /// Reset link state: flush the connection and suppress sequence
    /// warnings for the handshake that follows, mirroring the
    /// reference tool's `setup()`.
    pub fn handshake(&mut self) -> Result<u32, RegisterBusError> {
        self.flush_connection()?;
        self.no_seq_warnings = true;
        let vers_module = self.map.vers;
        let reg = vers_module.register("code_version").expect("vers.code_version");
        let result = self.read_reg(vers_module.base, reg);
        self.no_seq_warnings = false;
        result
    }

    /// Read one bulk-mode frame if the socket has one buffered, for
    /// callers that prefer to poll rather than register a callback.
    fn poll_incoming(&mut self, deadline: Instant) -> Result<Option<(u8, u8)>, RegisterBusError> {
        loop {
            match frame::scan(&self.rx_buf) {
                Scan::NeedMore => {}
                Scan::Garbage { consumed } => {
                    self.warn(format!("discarding {consumed} unparseable bytes"));
                    self.rx_buf.drain(..consumed);
                    continue;
                }
                Scan::Frame { consumed, frame } => {
                    self.rx_buf.drain(..consumed);
                    if let Some(result) = self.dispatch(frame)? {
                        return Ok(Some(result));
                    }
                    continue;
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let n = self.port.read(&mut self.scratch)?;
            if n == 0 {
                continue;
            }
            self.rx_buf.extend_from_slice(&self.scratch[..n]);
        }
    }

    /// Track the global receive sequence and route a frame either to
    /// the response handler or to the bulk sink.
    fn dispatch(&mut self, frame: DeviceFrame) -> Result<Option<(u8, u8)>, RegisterBusError> {
        let expected = (self.rx_seq + 1) & 0x3f;
        if frame.seq != expected && !self.no_seq_warnings {
            self.warn(format!(
                "receive sequence mismatch ({} vs {})",
                frame.seq, self.rx_seq
            ));
        }
        self.rx_seq = frame.seq;

        match frame.header {
            STREAM_RESPONSE => {
                if frame.data.len() != 2 {
                    return Err(RegisterBusError::MalformedResponse {
                        len: frame.data.len(),
                    });
                }
                Ok(Some((frame.data[0], frame.data[1])))
            }
            STREAM_BULK => {
                if self.bulk_mode {
                    self.bulk_queue.push(frame.data);
                } else {
                    self.warn("message (bulk stream) with no active capture");
                }
                Ok(None)
            }
            other => {
                self.warn(format!("message with unknown stream id 0x{other:02x}"));
                Ok(None)
            }
        }
    }

    /// Issue one byte-wide request/response transaction, retrying on
    /// timeout and resyncing on an err-flagged response.
    fn transact(&mut self, is_write: bool, addr: u16, val: u8) -> Result<u8, RegisterBusError> {
        let mut cmd_seq = self.tx_seq;
        let mut msg = frame::encode_request(cmd_seq, is_write, addr, val);
        self.port.write_all(&msg)?;

        let mut attempts = 0u32;
        let mut deadline = Instant::now() + REQUEST_DEADLINE;
        loop {
            match self.poll_incoming(deadline)? {
                Some((errseq, res)) => {
                    self.tx_seq = errseq & 0x3f;
                    let err = errseq & 0x80 != 0;
                    if err {
                        if !self.no_seq_warnings {
                            self.warn(format!(
                                "send sequence mismatch (seq {} vs {})",
                                self.tx_seq, cmd_seq
                            ));
                        }
                        attempts += 1;
                        if attempts > MAX_RETRIES {
                            return Err(RegisterBusError::ResyncFailed { attempts });
                        }
                        cmd_seq = self.tx_seq;
                        msg = frame::encode_request(cmd_seq, is_write, addr, val);
                        self.port.write_all(&msg)?;
                        continue;
                    }
                    if self.tx_seq != (cmd_seq + 1) & 0x3f {
                        if !self.no_seq_warnings {
                            self.warn(format!(
                                "response to unknown query (seq {} vs {})",
                                self.tx_seq, cmd_seq
                            ));
                        }
                        continue;
                    }
                    return Ok(res);
                }
                None => {
                    self.warn("timeout in message handler, retrying");
                    attempts += 1;
                    if attempts > MAX_RETRIES {
                        return Err(RegisterBusError::Timeout { attempts });
                    }
                    self.flush_connection()?;
                    self.port.write_all(&msg)?;
                    deadline = Instant::now() + REQUEST_DEADLINE;
                }
            }
        }
    }

    /// Write a raw byte at an absolute 16-bit address (`module << 8 |
    /// offset`).
    pub fn write_byte_at(&mut self, addr: u16, val: u8) -> Result<(), RegisterBusError> {
        self.transact(true, addr, val)?;
        Ok(())
    }

    /// Read a raw byte at an absolute 16-bit address.
    pub fn read_byte_at(&mut self, addr: u16) -> Result<u8, RegisterBusError> {
        self.transact(false, addr, 0)
    }

    /// Write a register, splitting multi-byte registers into
    /// little-endian per-byte requests.
    pub fn write_reg(&mut self, module_base: u8, reg: Register) -> RegWriter<'_, T> {
        RegWriter {
            bus: self,
            module_base,
            reg,
        }
    }

    /// Read a register, reassembling little-endian bytes into the
    /// returned value.
    pub fn read_reg(&mut self, module_base: u8, reg: Register) -> Result<u32, RegisterBusError> {
        let base_addr = ((module_base as u16) << 8) | reg.offset as u16;
        let mut val: u32 = 0;
        for i in 0..reg.size.bytes() {
            let byte = self.read_byte_at(base_addr + i as u16)?;
            val |= (byte as u32) << (8 * i);
        }
        Ok(val)
    }

    pub fn write_reg_value(
        &mut self,
        module_base: u8,
        reg: Register,
        val: u32,
    ) -> Result<(), RegisterBusError> {
        let base_addr = ((module_base as u16) << 8) | reg.offset as u16;
        for i in 0..reg.size.bytes() {
            let byte = ((val >> (8 * i)) & 0xff) as u8;
            self.write_byte_at(base_addr + i as u16, byte)?;
        }
        Ok(())
    }
}

/// Builder returned by [`RegisterBus::write_reg`]; call `.value(v)` to
/// perform the write. Exists only to give `write_reg` and
/// `write_reg_value` distinct, non-stuttering call sites; it does no
/// buffering of its own.
pub struct RegWriter<'a, T> {
    bus: &'a mut RegisterBus<T>,
    module_base: u8,
    reg: Register,
}

impl<'a, T: Transport> RegWriter<'a, T> {
    pub fn value(self, val: u32) -> Result<(), RegisterBusError> {
        self.bus.write_reg_value(self.module_base, self.reg, val)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registers;
    use std::collections::VecDeque;

    /// An in-process loopback transport driven by a scripted device:
    /// on each write, it hands back whatever frames the test queued.
    struct ScriptedDevice {
        sent: Vec<u8>,
        responses: VecDeque<Vec<u8>>,
    }

    impl ScriptedDevice {
        fn new() -> Self {
            Self {
                sent: Vec::new(),
                responses: VecDeque::new(),
            }
        }

        fn push_response(&mut self, bytes: Vec<u8>) {
            self.responses.push_back(bytes);
        }
    }

    impl Transport for ScriptedDevice {
        fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
            self.sent.extend_from_slice(buf);
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if let Some(next) = self.responses.pop_front() {
                let n = next.len().min(buf.len());
                buf[..n].copy_from_slice(&next[..n]);
                Ok(n)
            } else {
                Ok(0)
            }
        }
    }

    fn response_frame(seq: u8, err: bool, errseq: u8, val: u8) -> Vec<u8> {
        let flag = if err { 0x80 } else { 0x00 };
        let data = [errseq | flag, val];
        let len_seq = ((data.len() as u16) << 6) | (seq as u16 & 0x3f);
        let mut buf = vec![STREAM_RESPONSE, (len_seq & 0xff) as u8, (len_seq >> 8) as u8];
        buf.extend_from_slice(&data);
        let crc = crate::crc::to_bytes(crate::crc::crc16(buf.iter().copied()));
        buf.extend_from_slice(&crc);
        buf.push(frame::TERMINATOR);
        buf
    }

    #[test]
    fn read_byte_round_trip() {
        let mut dev = ScriptedDevice::new();
        // seq 0 request -> device echoes seq 1, no error, value 0x2a
        dev.push_response(response_frame(1, false, 1, 0x2a));
        let mut bus = RegisterBus::new(dev, registers::map());
        let v = bus.read_byte_at(0x5300).unwrap();
        assert_eq!(v, 0x2a);
        assert_eq!(bus.tx_seq, 1);
        assert_eq!(bus.rx_seq, 1);
    }

    #[test]
    fn err_bit_triggers_resend_with_echoed_seq() {
        let mut dev = ScriptedDevice::new();
        // First reply reports an error and echoes seq 5; bus must resend
        // with that seq, then accept the next clean reply.
        dev.push_response(response_frame(1, true, 5, 0x00));
        dev.push_response(response_frame(2, false, 6, 0x99));
        let mut bus = RegisterBus::new(dev, registers::map());
        let v = bus.read_byte_at(0x0001).unwrap();
        assert_eq!(v, 0x99);
        // the resent frame should carry seq 5
        let resent = &bus.port.sent[10..20];
        assert_eq!(resent[1], 5);
    }

    #[test]
    fn four_byte_register_assembles_little_endian() {
        let mut dev = ScriptedDevice::new();
        for (i, byte) in [0x01u8, 0x02, 0x03, 0x04].into_iter().enumerate() {
            dev.push_response(response_frame((i + 1) as u8, false, (i + 1) as u8, byte));
        }
        let m = registers::map();
        let mut bus = RegisterBus::new(dev, m);
        let reg = m.vers.register("code_version").unwrap();
        let val = bus.read_reg(m.vers.base, reg).unwrap();
        assert_eq!(val, 0x04030201);
    }

    #[test]
    fn write_reg_emits_one_request_per_byte_little_endian() {
        let mut dev = ScriptedDevice::new();
        for i in 0..4u8 {
            dev.push_response(response_frame(i + 1, false, i + 1, 0));
        }
        let m = registers::map();
        let mut bus = RegisterBus::new(dev, m);
        let reg = m.vers.register("code_version").unwrap();
        bus.write_reg_value(m.vers.base, reg, 0x04030201).unwrap();
        // four single-byte write requests, one per address, each
        // carrying the corresponding little-endian byte of the value.
        let sent = &bus.port.sent;
        assert_eq!(sent.len(), 4 * 10);
        for (i, expect_byte) in [0x01u8, 0x02, 0x03, 0x04].into_iter().enumerate() {
            let frame = &sent[i * 10..i * 10 + 10];
            assert_eq!(frame[6], expect_byte);
        }
    }

    #[test]
    fn handshake_survives_seq_discontinuity_and_reads_version() {
        let mut dev = ScriptedDevice::new();
        dev.push_response(response_frame(0x2a, false, 0x2a, 0x03));
        dev.push_response(response_frame(0x2b, false, 0x2c, 0x02));
        dev.push_response(response_frame(0x2d, false, 0x2e, 0x01));
        dev.push_response(response_frame(0x2f, false, 0x30, 0x00));
        let mut bus = RegisterBus::new(dev, registers::map());
        let version = bus.handshake().unwrap();
        assert_eq!(version, 0x00010203);
        assert!(!bus.no_seq_warnings);
    }

    #[test]
    fn malformed_response_length_is_an_error() {
        let mut dev = ScriptedDevice::new();
        let mut buf = vec![STREAM_RESPONSE, (1u16 << 6) as u8 | 1, 0, 0xaa];
        let crc = crate::crc::to_bytes(crate::crc::crc16(buf.iter().copied()));
        buf.extend_from_slice(&crc);
        buf.push(frame::TERMINATOR);
        dev.push_response(buf);
        let mut bus = RegisterBus::new(dev, registers::map());
        let err = bus.read_byte_at(0x0000).unwrap_err();
        assert!(matches!(err, RegisterBusError::MalformedResponse { len: 1 }));
    }
}
