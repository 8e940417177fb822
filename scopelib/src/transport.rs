//! Capability trait for whatever byte pipe carries frames to and from
//! the device. Kept separate from `std::io::{Read, Write}` so callers
//! can hand the register bus a boxed trait object (USB) or a concrete
//! type (UART, a file) without the bus caring which.

use std::io;

pub trait Transport {
    /// Write the full buffer, or fail. Framed writes are small (10
    /// bytes) so short writes are treated as errors rather than
    /// retried internally.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Non-blocking-ish read: returns as many bytes as are available
    /// up to `buf.len()`, or `0` if none arrived before the
    /// implementation's own read timeout.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<T: io::Read + io::Write + ?Sized> Transport for T {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(self, buf)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self, buf)
    }
}
