//! PLL phase control for the second ADC's sampling clock, used to
//! offset interleaved channels by a quarter sample period.

use crate::error::RegisterBusError;
use crate::register_bus::RegisterBus;
use crate::registers::RegisterMap;
use crate::transport::Transport;

/// Phase step resolution of the `req_phase` register, in picoseconds.
const PHASE_STEP_PS: u32 = 100;
/// Target offset applied when interleaving two ADCs onto one channel.
const INTERLEAVE_PHASE_PS: u32 = 4000;

pub struct Pll<'a, T> {
    bus: &'a mut RegisterBus<T>,
    map: RegisterMap,
}

impl<'a, T: Transport> Pll<'a, T> {
    pub fn new(bus: &'a mut RegisterBus<T>) -> Self {
        let map = *bus.map();
        Self { bus, map }
    }

    fn wait_ready(&mut self) -> Result<(), RegisterBusError> {
        let status = self.map.pp.register("status").expect("pp.status");
        loop {
            if self.bus.read_reg(self.map.pp.base, status)? == 0 {
                return Ok(());
            }
        }
    }

    /// Set the clock phase for interleaved vs. non-interleaved
    /// acquisition; a no-op if the phase is already at the target.
    pub fn setup(&mut self, interleaving: bool) -> Result<(), RegisterBusError> {
        let target_ps = if interleaving { INTERLEAVE_PHASE_PS } else { 0 };
        let target = target_ps / PHASE_STEP_PS;
        let req_phase = self.map.pp.register("req_phase").expect("pp.req_phase");
        let current = self.bus.read_reg(self.map.pp.base, req_phase)?;
        if current == target {
            return Ok(());
        }
        self.wait_ready()?;
        self.bus
            .write_reg_value(self.map.pp.base, req_phase, target)?;
        self.wait_ready()
    }
}
