//! SPI configuration interface to the ADC, exposed through the FPGA's
//! `adcspi` register block.

use crate::error::RegisterBusError;
use crate::register_bus::RegisterBus;
use crate::registers::RegisterMap;
use crate::transport::Transport;

/// (register, value) pairs sent to bring the ADC out of its power-on
/// defaults, in the order the reference driver sends them.
const SETUP_SEQUENCE: &[(u8, u8)] = &[
    (0x01, 0x00), // non-multiplexed output
    (0x02, 0x03), // disable DOR and DCLK output
    (0x03, 0b1011_1111),
    (0x04, 0x00),
    (0x05, 0x00),
    (0x06, 0x10), // offset binary output
    (0x08, 0x00),
];

pub struct Spi<'a, T> {
    bus: &'a mut RegisterBus<T>,
    map: RegisterMap,
}

impl<'a, T: Transport> Spi<'a, T> {
    pub fn new(bus: &'a mut RegisterBus<T>) -> Self {
        let map = *bus.map();
        Self { bus, map }
    }

    fn wait_ready(&mut self) -> Result<(), RegisterBusError> {
        let state = self.map.adcspi.register("state").expect("adcspi.state");
        loop {
            if self.bus.read_reg(self.map.adcspi.base, state)? == 0 {
                return Ok(());
            }
        }
    }

    pub fn send(&mut self, reg: u8, val: u8) -> Result<(), RegisterBusError> {
        self.wait_ready()?;
        let data0 = self.map.adcspi.register("data0").expect("adcspi.data0");
        let data1 = self.map.adcspi.register("data1").expect("adcspi.data1");
        let state = self.map.adcspi.register("state").expect("adcspi.state");
        self.bus
            .write_reg_value(self.map.adcspi.base, data0, (reg & 0x7f) as u32)?;
        self.bus
            .write_reg_value(self.map.adcspi.base, data1, val as u32)?;
        self.bus
            .write_reg_value(self.map.adcspi.base, state, 0x01)?;
        self.wait_ready()
    }

    pub fn setup(&mut self) -> Result<(), RegisterBusError> {
        for &(reg, val) in SETUP_SEQUENCE {
            self.send(reg, val)?;
        }
        Ok(())
    }
}
