//! I2C master built on the OpenCores-style `i2c` register block
//! (`prer`/`ctr`/`txr`/`rxr`/`cr`/`sr`), driving byte-at-a-time
//! transactions the way the reference tool's `I2CHelper` does.

use crate::error::I2cError;
use crate::register_bus::RegisterBus;
use crate::registers::RegisterMap;
use crate::transport::Transport;

const CR_START: u8 = 1 << 7;
const CR_WRITE: u8 = 1 << 4;
const CR_READ: u8 = 1 << 5;
const CR_STOP: u8 = 1 << 6;
const CR_ACK: u8 = 1 << 3;
const SR_TIP: u8 = 1 << 1;
const SR_IF: u8 = 1 << 0;

/// Bound on per-byte retry before giving up on a device; the reference
/// tool spins on this forever, we make the budget explicit instead.
const MAX_RETRIES: u32 = 100;

pub struct I2c<'a, T> {
    bus: &'a mut RegisterBus<T>,
    map: RegisterMap,
}

impl<'a, T: Transport> I2c<'a, T> {
    pub fn new(bus: &'a mut RegisterBus<T>) -> Self {
        let map = *bus.map();
        Self { bus, map }
    }

    /// Configure the prescaler for the given system clock targeting
    /// 100 kHz, per the reference `I2CHelper.setup`.
    pub fn setup(&mut self, fpga_freq: u32) -> Result<(), I2cError> {
        const I2C_FREQ: u32 = 100_000;
        let ctr = self.map.i2c.register("ctr").expect("i2c.ctr");
        let prer = self.map.i2c.register("prer").expect("i2c.prer");
        self.bus.write_reg_value(self.map.i2c.base, ctr, 0x00)?;
        let isp = fpga_freq / (5 * I2C_FREQ) - 1;
        self.bus.write_reg_value(self.map.i2c.base, prer, isp)?;
        self.bus.write_reg_value(self.map.i2c.base, ctr, 0x80)?;
        Ok(())
    }

    fn send_byte(&mut self, cmdflags: u8, data: Option<u8>) -> Result<u8, I2cError> {
        let txr = self.map.i2c.register("txr").expect("i2c.txr");
        let cr = self.map.i2c.register("cr").expect("i2c.cr");
        let sr = self.map.i2c.register("sr").expect("i2c.sr");
        if cmdflags & CR_READ == 0 {
            self.bus
                .write_reg_value(self.map.i2c.base, txr, data.unwrap_or(0) as u32)?;
        }
        self.bus
            .write_reg_value(self.map.i2c.base, cr, cmdflags as u32)?;
        let res = loop {
            let res = self.bus.read_reg(self.map.i2c.base, sr)? as u8;
            if res & SR_TIP == 0 {
                break res;
            }
        };
        let expected = (cmdflags & CR_STOP) ^ CR_STOP;
        if res & !SR_IF != expected {
            if expected != 0 {
                self.bus.write_reg_value(self.map.i2c.base, cr, CR_STOP as u32)?;
            }
            return Err(I2cError::ShortTransfer { expected: 0, got: 0 });
        }
        Ok(res)
    }

    fn try_transaction(
        &mut self,
        addr: u8,
        write: &[u8],
        read_count: usize,
        out: &mut Vec<u8>,
    ) -> Result<(), I2cError> {
        let addrwr = addr << 1;
        if !write.is_empty() {
            self.send_byte(CR_START | CR_WRITE, Some(addrwr))?;
            for (i, &b) in write.iter().enumerate() {
                let mut cmdflags = CR_WRITE;
                if read_count == 0 && i == write.len() - 1 {
                    cmdflags |= CR_STOP;
                }
                self.send_byte(cmdflags, Some(b))?;
            }
        }
        if read_count > 0 {
            self.send_byte(CR_START | CR_WRITE, Some(addrwr | 1))?;
            let rxr = self.map.i2c.register("rxr").expect("i2c.rxr");
            for i in 0..read_count {
                let mut cmdflags = CR_READ;
                if i == read_count - 1 {
                    cmdflags |= CR_STOP | CR_ACK;
                }
                self.send_byte(cmdflags, None)?;
                out.push(self.bus.read_reg(self.map.i2c.base, rxr)? as u8);
            }
        }
        Ok(())
    }

    /// Run a full write-then-read transaction against a 7-bit address,
    /// retrying the whole thing (bounded) on a bus fault.
    pub fn transaction(
        &mut self,
        addr: u8,
        write: &[u8],
        read_count: usize,
    ) -> Result<Vec<u8>, I2cError> {
        let mut attempts = 0;
        loop {
            let mut out = Vec::with_capacity(read_count);
            match self.try_transaction(addr, write, read_count, &mut out) {
                Ok(()) => return Ok(out),
                Err(_) => {
                    attempts += 1;
                    if attempts > MAX_RETRIES {
                        return Err(I2cError::RetriesExceeded { addr, attempts });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn expected_sr_after_start_is_ack_bit_clear() {
        // A clean start+write expects the ack/not-stop flag to read back as
        // `~(1<<6)` with the stop bit set: sanity-check the bit algebra
        // directly rather than requiring hardware.
        let cmdflags = CR_START | CR_WRITE;
        let expected = (cmdflags & CR_STOP) ^ CR_STOP;
        assert_eq!(expected, CR_STOP);
    }

    #[test]
    fn status_check_masks_if_bit_not_ack_bit() {
        // send_byte compares `res & !SR_IF` against `expected`; the IF bit
        // (set by the core on every completed transfer) must be masked
        // off, while RxACK stays in the comparison so a real NACK is
        // still caught.
        let cmdflags = CR_START | CR_WRITE;
        let expected = (cmdflags & CR_STOP) ^ CR_STOP;

        // A real device always has IF set once TIP clears; that alone
        // must not trip the check.
        let acked = expected | SR_IF;
        assert_eq!(acked & !SR_IF, expected);

        // A device that NACKs flips the RxACK bit (1<<7); that must
        // still fail the check.
        let nacked = (expected ^ (1 << 7)) | SR_IF;
        assert_ne!(nacked & !SR_IF, expected);
    }
}
