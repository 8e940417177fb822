//! Hi-speed USB transport for boards wired through an FTDI synchronous
//! FIFO, selected with `--usbhi`. Kept behind the `usbhi` feature since
//! most setups talk over a plain UART.

use scopelib::Transport;

/// FTDI synchronous FIFO chunk size the reference tooling configures
/// with `read_data_set_chunksize(0x10000)`.
const CHUNK_SIZE: usize = 0x10000;

pub struct UsbFifoTransport {
    device: libftdi1::Device,
}

impl UsbFifoTransport {
    pub fn open(serial: &str) -> anyhow::Result<Self> {
        let mut device = libftdi1::Builder::new()
            .usb_vid_pid(0x0403, 0x6014)
            .with_serial(serial)
            .open()?;
        device.set_bitmode(0xff, libftdi1::BitMode::SyncFifo)?;
        device.purge_usb_buffers()?;
        std::thread::sleep(std::time::Duration::from_millis(50));
        Ok(Self { device })
    }

    pub fn list() -> anyhow::Result<Vec<String>> {
        Ok(libftdi1::list_devices()?
            .into_iter()
            .map(|d| d.serial)
            .collect())
    }
}

// Not `Read + Write`: the device's own chunking contract doesn't map
// cleanly onto short reads/writes, so this is a manual `Transport`
// impl rather than going through the blanket one.
impl Transport for UsbFifoTransport {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        for chunk in buf.chunks(CHUNK_SIZE) {
            self.device
                .write_all(chunk)
                .map_err(std::io::Error::other)?;
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let want = buf.len().min(CHUNK_SIZE);
        self.device
            .read(&mut buf[..want])
            .map_err(std::io::Error::other)
    }
}
