//! MCP4728 DAC driven over I2C: each channel's drive voltage is
//! written through a 12-bit-plus-gain-select shadow value.

use crate::error::I2cError;
use crate::i2c::I2c;
use crate::transport::Transport;

pub const I2C_ADDR: u8 = 0x60;

const GAIN_SELECT_BIT: u16 = 1 << 12;
const GAIN1_FULL_SCALE: f64 = 2.048;
const GAIN2_FULL_SCALE: f64 = 4.096;
const GAIN_THRESHOLD: f64 = 2.0485;

pub struct Dac;

impl Dac {
    /// Encode a drive voltage (clamped to `0.0..=3.3`) into the 13-bit
    /// value the DAC register expects: bit 12 selects the ×2 gain
    /// range, the low 12 bits are the code within that range.
    pub fn encode_volt(volt: f64) -> u16 {
        let volt = volt.clamp(0.0, 3.3);
        if volt >= GAIN_THRESHOLD {
            let code = (4096.0 * volt / GAIN2_FULL_SCALE).round() as i32;
            code.clamp(0, 0xfff) as u16 | GAIN_SELECT_BIT
        } else {
            let code = (4096.0 * volt / GAIN1_FULL_SCALE).round() as i32;
            code.clamp(0, 0xfff) as u16
        }
    }

    pub fn decode_volt(value: u16) -> f64 {
        if value & GAIN_SELECT_BIT != 0 {
            (value & 0xfff) as f64 / 4096.0 * GAIN2_FULL_SCALE
        } else {
            (value & 0xfff) as f64 / 4096.0 * GAIN1_FULL_SCALE
        }
    }

    /// The voltage that would actually be produced after quantization,
    /// for reporting the effective channel range.
    pub fn calc_volt(volt: f64) -> f64 {
        Self::decode_volt(Self::encode_volt(volt))
    }

    pub fn set_channel<T: Transport>(
        i2c: &mut I2c<'_, T>,
        channel: u8,
        volt: f64,
    ) -> Result<(), I2cError> {
        let value = Self::encode_volt(volt);
        let write = [
            0x40 | (channel << 1),
            ((value >> 8) & 0x1f) as u8 | 0x80,
            (value & 0xff) as u8,
        ];
        i2c.transaction(I2C_ADDR, &write, 0)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_volts_is_zero_code() {
        assert_eq!(Dac::encode_volt(0.0), 0);
    }

    #[test]
    fn threshold_selects_gain_range() {
        assert_eq!(Dac::encode_volt(GAIN_THRESHOLD) & GAIN_SELECT_BIT, GAIN_SELECT_BIT);
        assert_eq!(Dac::encode_volt(GAIN_THRESHOLD - 0.01) & GAIN_SELECT_BIT, 0);
    }

    #[test]
    fn clamps_out_of_range_inputs() {
        assert_eq!(Dac::encode_volt(-5.0), Dac::encode_volt(0.0));
        assert_eq!(Dac::encode_volt(10.0), Dac::encode_volt(3.3));
    }

    #[quickcheck_macros::quickcheck]
    fn decode_is_bounded_by_the_selected_range(volt: f64) -> bool {
        if !volt.is_finite() {
            return true;
        }
        let decoded = Dac::calc_volt(volt);
        (0.0..=GAIN2_FULL_SCALE * 1.0001).contains(&decoded)
    }

    #[test]
    fn round_trip_is_idempotent_once_encoded() {
        for milli in 0..3300 {
            let v = milli as f64 / 1000.0;
            let once = Dac::calc_volt(v);
            let twice = Dac::calc_volt(once);
            assert!((once - twice).abs() < 1e-9, "{v} -> {once} -> {twice}");
        }
    }
}
