//! Per-channel analog frontend: mode/probe selection, trigger grammar,
//! and the voltage↔ADC-code conversion used both to program the
//! trigger threshold and to decode captured samples.

use crate::dac::Dac;
use crate::error::ConfigError;
use crate::i2c::I2c;
use crate::ioexpander::IoExpander;
use crate::register_bus::RegisterBus;
use crate::registers::RegisterMap;
use crate::transport::Transport;

/// Empirically-derived gain factors for the two hardware gain ranges.
/// Per-scope calibration constants; these are the values the
/// reference tooling ships as defaults.
const ADC_GAIN1_FACTOR: f64 = -1.5 * 1_100_000. / (200_000. * 255.);
const ADC_GAIN10_FACTOR: f64 = -1.5 * 1_100_000. / (2_000_000. * 255.);

#[derive(Debug, Clone, Copy)]
struct ProbeInfo {
    dac: f64,
    adc_factor: f64,
}

fn base_probe(mode: &str) -> Option<ProbeInfo> {
    Some(match mode {
        "ac1x" => ProbeInfo {
            dac: 1.235,
            adc_factor: ADC_GAIN1_FACTOR,
        },
        "ac10x" => ProbeInfo {
            dac: 2.35,
            adc_factor: ADC_GAIN10_FACTOR,
        },
        "dc1x" => ProbeInfo {
            dac: 1.0575,
            adc_factor: ADC_GAIN1_FACTOR,
        },
        "dc10x" => ProbeInfo {
            dac: 1.5535,
            adc_factor: ADC_GAIN10_FACTOR,
        },
        _ => return None,
    })
}

fn probe_override(mode: &str, probe: &str) -> Option<ProbeInfo> {
    Some(match (mode, probe) {
        ("dc1x", "10x") => ProbeInfo {
            dac: 1.2125,
            adc_factor: ADC_GAIN1_FACTOR * 10.,
        },
        ("dc10x", "10x") => ProbeInfo {
            dac: 2.329,
            adc_factor: ADC_GAIN10_FACTOR * 10.,
        },
        _ => return None,
    })
}

/// `(ac_isolate, gain10)` for each recognized channel mode.
pub const MODES: &[&str] = &["dc1x", "dc10x", "ac1x", "ac10x"];

fn parse_mode(mode: &str) -> Option<(bool, bool)> {
    match mode {
        "dc1x" => Some((false, false)),
        "dc10x" => Some((false, true)),
        "ac1x" => Some((true, false)),
        "ac10x" => Some((true, true)),
        _ => None,
    }
}

/// Edge-trigger code plus the "valid" bit; see [`parse_trigger`].
pub const TRIGGER_VALID_BIT: u8 = 0x01;

/// Parse a trigger expression like `"<1.25"`, `">-0.5"`, `"~0"`, or a
/// bare `"1.0"` (defaulting to falling-edge).
pub fn parse_trigger(expr: &str, channel: usize) -> Result<(u8, f64), ConfigError> {
    let trimmed = expr.trim();
    let (code, rest) = match trimmed.chars().next() {
        Some('<') => (0x04, &trimmed[1..]),
        Some('>') => (0x06, &trimmed[1..]),
        Some('_') => (0x00, &trimmed[1..]),
        Some('~') => (0x02, &trimmed[1..]),
        _ => (0x04, trimmed),
    };
    let volt: f64 = rest.trim().parse().map_err(|_| ConfigError::InvalidTrigger {
        channel,
        given: expr.to_string(),
    })?;
    Ok((code | TRIGGER_VALID_BIT, volt))
}

pub struct AfConfig {
    pub channel: usize,
    pub interleave_channel: usize,
    pub interleave: bool,
    pub capturing: bool,
    pub ac_isolate: bool,
    pub gain10: bool,
    pub sw_imp10mohm: bool,
    pub sw_gain100: bool,
    pub dac_v: f64,
    pub base_adc: f64,
    pub base_v: f64,
    pub adc_factor: f64,
    pub trigger: Option<(u8, f64)>,
}

impl AfConfig {
    pub fn new(channel: usize) -> Self {
        Self {
            channel,
            interleave_channel: channel % 2,
            interleave: false,
            capturing: false,
            ac_isolate: false,
            gain10: false,
            sw_imp10mohm: false,
            sw_gain100: false,
            dac_v: 0.0,
            base_adc: 255.0 / 2.0,
            base_v: 0.0,
            adc_factor: ADC_GAIN1_FACTOR,
            trigger: None,
        }
    }

    /// Resolve `mode`/`probe` strings into the numeric config fields.
    /// Mirrors the AC-isolate fallback: the AC-mode DAC bias and base
    /// values come from the base DC entry, but `adc_factor` is kept
    /// from the AC-probe-specific entry when one exists.
    pub fn set_mode_and_probe(&mut self, mode: &str, probe: Option<&str>) -> Result<(), ConfigError> {
        let mode = mode.trim().to_lowercase();
        let (ac_isolate, gain10) = parse_mode(&mode).ok_or_else(|| ConfigError::UnknownAfMode {
            channel: self.channel,
            given: mode.clone(),
            accepted: MODES,
        })?;
        self.ac_isolate = ac_isolate;
        self.gain10 = gain10;

        let base_info = base_probe(&mode);
        let info = match probe {
            Some(p) => {
                let p = p.trim().to_lowercase();
                let direct = probe_override(&mode, &p);
                let fallback = if direct.is_none() && mode.starts_with("ac") {
                    probe_override(&format!("dc{}", &mode[2..]), &p)
                } else {
                    None
                };
                direct.or(fallback).ok_or_else(|| ConfigError::UnknownProbeMode {
                    channel: self.channel,
                    given: p.clone(),
                    accepted: &["10x"],
                })?
            }
            None => base_info.ok_or(ConfigError::UnknownAfMode {
                channel: self.channel,
                given: mode.clone(),
                accepted: MODES,
            })?,
        };

        self.adc_factor = info.adc_factor;
        let effective = if ac_isolate {
            base_info.unwrap_or(info)
        } else {
            info
        };
        self.dac_v = effective.dac;
        Ok(())
    }

    pub fn set_trigger(&mut self, expr: &str) -> Result<(), ConfigError> {
        self.trigger = Some(parse_trigger(expr, self.channel)?);
        Ok(())
    }

    pub fn have_trigger(&self) -> bool {
        self.trigger.is_some()
    }

    /// Human-readable channel status, for the CSV's `;`-prefixed
    /// metadata header.
    pub fn status_line(&self) -> String {
        let trig = match self.trigger {
            Some((code, volt)) => {
                let ttype = match code & !TRIGGER_VALID_BIT {
                    0x04 => "falling",
                    0x06 => "rising",
                    0x00 => "below",
                    0x02 => "above",
                    _ => "?",
                };
                let tvolt = self.calc_probe_volt(self.calc_adc(volt) as f64);
                format!("{ttype} {tvolt:.6}V")
            }
            None => "None".to_owned(),
        };
        let min_v = self.calc_probe_volt(255.0);
        let max_v = self.calc_probe_volt(0.0);
        format!(
            "channel{}: capturing={} ac_isolate={} 50ohm={} gain10x={} gain100x={}\n  DAC={:.4}V base_adc={:.6} base_v={:.6}V adc_factor={:.6}V\n  range={:.6}V:{:.6}V trigger: {trig}",
            self.channel,
            self.capturing as u8,
            self.ac_isolate as u8,
            !self.sw_imp10mohm as u8,
            self.gain10 as u8,
            self.sw_gain100 as u8,
            self.dac_v,
            self.base_adc,
            self.base_v,
            self.adc_factor,
            min_v,
            max_v,
        )
    }

    /// ADC code (0..=255) that would produce the given probe voltage.
    pub fn calc_adc(&self, probe_v: f64) -> u8 {
        let adc = (probe_v - self.base_v) / self.adc_factor + self.base_adc;
        adc.round().clamp(0.0, 255.0) as u8
    }

    /// Probe voltage corresponding to an 8-bit ADC reading (possibly
    /// fractional, since decoded samples may be averaged).
    pub fn calc_probe_volt(&self, adc_result: f64) -> f64 {
        self.base_v + (adc_result - self.base_adc) * self.adc_factor
    }

    fn is_active(&self) -> bool {
        let mut active = self.capturing || self.have_trigger();
        if self.interleave && self.interleave_channel != self.channel {
            active = false;
        }
        active
    }

    /// Drive the DC-connect/gain switches, program the DAC bias, and
    /// write the trigger registers for this channel.
    pub fn setup_channel<T: Transport>(
        &self,
        bus: &mut RegisterBus<T>,
        ioexp1: &mut IoExpander,
    ) -> Result<(), crate::error::CaptureError> {
        let active = self.is_active();
        let dc_connect = active && !self.ac_isolate;
        let gain10 = active && self.gain10;
        let dac_v = if active { self.dac_v } else { 0.0 };

        ioexp1.set_output(&format!("dc_connect_ch{}", self.channel), dc_connect);
        ioexp1.set_output(&format!("gain_ch{}", self.channel), gain10);
        Dac::set_channel(&mut I2c::new(bus), self.channel as u8, dac_v)?;

        let map: RegisterMap = *bus.map();
        let module = map.channel(self.channel);
        let trigger = module.register("trigger").expect("trigger");
        bus.write_reg_value(module.base, trigger, 0x00)?;
        if let Some((code, volt)) = self.trigger {
            let thresh = module.register("thresh").expect("thresh");
            let tadc = self.calc_adc(volt);
            bus.write_reg_value(module.base, thresh, tadc as u32)?;
            bus.write_reg_value(module.base, trigger, code as u32)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trigger_grammar() {
        assert_eq!(parse_trigger("<1.25", 0).unwrap(), (0x05, 1.25));
        assert_eq!(parse_trigger(">-0.5", 0).unwrap(), (0x07, -0.5));
        assert_eq!(parse_trigger("~0", 0).unwrap(), (0x03, 0.0));
        assert_eq!(parse_trigger("1.0", 0).unwrap(), (0x05, 1.0));
    }

    #[test]
    fn trigger_rejects_garbage() {
        assert!(parse_trigger("<banana", 0).is_err());
    }

    #[test]
    fn voltage_round_trip_over_full_adc_range() {
        let mut cfg = AfConfig::new(0);
        cfg.set_mode_and_probe("dc1x", None).unwrap();
        for adc in 0u16..=255 {
            let v = cfg.calc_probe_volt(adc as f64);
            assert_eq!(cfg.calc_adc(v), adc as u8, "adc={adc}");
        }
    }

    #[test]
    fn ac_mode_without_probe_uses_base_entry() {
        let mut cfg = AfConfig::new(0);
        cfg.set_mode_and_probe("ac1x", None).unwrap();
        assert_eq!(cfg.dac_v, 1.235);
        assert_eq!(cfg.adc_factor, ADC_GAIN1_FACTOR);
    }

    #[test]
    fn ac_mode_with_10x_probe_falls_back_to_dc_then_overrides_adc_factor() {
        let mut cfg = AfConfig::new(0);
        cfg.set_mode_and_probe("ac1x", Some("10x")).unwrap();
        // adc_factor comes from the dc1x/10x override...
        assert_eq!(cfg.adc_factor, ADC_GAIN1_FACTOR * 10.);
        // ...but dac/base values come from the ac1x base entry, since
        // ac_isolate is set.
        assert_eq!(cfg.dac_v, 1.235);
    }

    #[test]
    fn dc_mode_with_10x_probe_uses_override_directly() {
        let mut cfg = AfConfig::new(0);
        cfg.set_mode_and_probe("dc10x", Some("10x")).unwrap();
        assert_eq!(cfg.dac_v, 2.329);
        assert_eq!(cfg.adc_factor, ADC_GAIN10_FACTOR * 10.);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let mut cfg = AfConfig::new(0);
        assert!(cfg.set_mode_and_probe("bogus", None).is_err());
    }
}
