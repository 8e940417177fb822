//! The frozen map from symbolic module/register names to FPGA
//! addresses, mirroring the on-device memory layout.

/// One FPGA peripheral's base address and register table.
#[derive(Debug, Clone, Copy)]
pub struct Module {
    pub base: u8,
    pub registers: &'static [(&'static str, Register)],
}

/// A register's byte offset within its module and its width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub offset: u8,
    pub size: RegSize,
}

/// Register widths the bus knows how to assemble from single-byte
/// requests. There is no native multi-byte transfer: each byte is its
/// own request/response round trip, assembled little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegSize {
    One,
    Two,
    Four,
}

impl RegSize {
    pub fn bytes(self) -> u8 {
        match self {
            RegSize::One => 1,
            RegSize::Two => 2,
            RegSize::Four => 4,
        }
    }
}

impl Module {
    /// Look up a register by name within this module.
    pub fn register(&self, name: &str) -> Option<Register> {
        self.registers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, r)| *r)
    }
}

macro_rules! regs {
    ($( $name:literal => ($offset:expr, $size:ident) ),* $(,)?) => {
        &[ $( ($name, Register { offset: $offset, size: RegSize::$size }) ),* ]
    };
}

const ADC_CHANNEL_REGS: &[(&str, Register)] = regs! {
    "trigger" => (0x00, One),
    "thresh" => (0x01, One),
    "status" => (0x20, One),
    "acc_cnt" => (0x21, One),
    "sum_mask" => (0x22, Two),
    "initial_sum" => (0x24, Two),
};

const SAMPLE_QUEUE_REGS: &[(&str, Register)] = regs! {
    "status" => (0x00, One),
    "frame_preface" => (0x02, Two),
    "frame_size" => (0x04, Four),
    "reg_fifo_position" => (0x08, Four),
    "frame_count" => (0x0c, Four),
};

const VERS_REGS: &[(&str, Register)] = regs! {
    "code_version" => (0x00, Four),
};

const ADC_SPI_REGS: &[(&str, Register)] = regs! {
    "state" => (0x00, One),
    "data0" => (0x02, One),
    "data1" => (0x03, One),
};

const I2C_REGS: &[(&str, Register)] = regs! {
    "prer" => (0x00, Two),
    "ctr" => (0x02, One),
    "txr" => (0x03, One),
    "rxr" => (0x03, One),
    "cr" => (0x04, One),
    "sr" => (0x04, One),
};

const PP_REGS: &[(&str, Register)] = regs! {
    "status" => (0x00, One),
    "req_phase" => (0x01, One),
    "cur_phase" => (0x02, One),
};

/// The complete frozen register map, built once and shared by
/// reference; never mutated and never reached for ambiently.
#[derive(Debug, Clone, Copy)]
pub struct RegisterMap {
    pub vers: Module,
    pub adcspi: Module,
    pub i2c: Module,
    pub pp: Module,
    pub channels: [Module; 4],
    pub sq: Module,
}

impl RegisterMap {
    pub fn channel(&self, index: usize) -> Module {
        self.channels[index]
    }
}

/// Build the frozen map. Cheap (no allocation beyond the `'static`
/// slices above); callers typically build it once at startup.
pub fn map() -> RegisterMap {
    RegisterMap {
        vers: Module {
            base: 0x00,
            registers: VERS_REGS,
        },
        adcspi: Module {
            base: 0x01,
            registers: ADC_SPI_REGS,
        },
        i2c: Module {
            base: 0x02,
            registers: I2C_REGS,
        },
        pp: Module {
            base: 0x03,
            registers: PP_REGS,
        },
        channels: [
            Module {
                base: 0x80,
                registers: ADC_CHANNEL_REGS,
            },
            Module {
                base: 0x81,
                registers: ADC_CHANNEL_REGS,
            },
            Module {
                base: 0x82,
                registers: ADC_CHANNEL_REGS,
            },
            Module {
                base: 0x83,
                registers: ADC_CHANNEL_REGS,
            },
        ],
        sq: Module {
            base: 0x87,
            registers: SAMPLE_QUEUE_REGS,
        },
    }
}

/// Combine a module base and register offset into the 16-bit address
/// space a request frame addresses (`module << 8 | offset`).
pub fn address(module: Module, register: Register) -> u16 {
    ((module.base as u16) << 8) | register.offset as u16
}
