//! Host-side driver for a four-channel FPGA-based oscilloscope: link
//! framing and CRC, the single-request register bus, the I2C/SPI/PLL
//! sub-protocols used to bring up the analog frontend, and the
//! sample-queue capture pipeline.

pub mod crc;
pub mod dac;
pub mod error;
pub mod frame;
pub mod frontend;
pub mod i2c;
pub mod ioexpander;
pub mod orchestrator;
pub mod pll;
pub mod register_bus;
pub mod registers;
pub mod sample_queue;
pub mod spi;
pub mod transport;

pub use error::CaptureError;
pub use orchestrator::Scope;
pub use register_bus::RegisterBus;
pub use registers::RegisterMap;
pub use sample_queue::{CaptureConfig, CaptureResult, SampleQueue, SampleRow};
pub use transport::Transport;
