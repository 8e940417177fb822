use std::io::{BufWriter, Read, Write};

/// Concrete transports selectable at construction, replacing the
/// reference tooling's runtime `.write`/`.read` member swap with one
/// capability interface and a fixed set of implementations.
pub enum ScopePort {
    Serial(BufWriter<Box<dyn serialport::SerialPort>>),
    File(BufWriter<std::fs::File>),
    #[cfg(feature = "usbhi")]
    UsbFifo(crate::usbhi::UsbFifoTransport),
}

impl Read for ScopePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Serial(port) => port.get_mut().read(buf),
            Self::File(port) => port.get_mut().read(buf),
            #[cfg(feature = "usbhi")]
            Self::UsbFifo(port) => scopelib::Transport::read(port, buf),
        }
    }
}

impl Write for ScopePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Serial(port) => port.write(buf),
            Self::File(port) => port.write(buf),
            #[cfg(feature = "usbhi")]
            Self::UsbFifo(port) => {
                scopelib::Transport::write_all(port, buf)?;
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Serial(port) => port.flush(),
            Self::File(port) => port.flush(),
            #[cfg(feature = "usbhi")]
            Self::UsbFifo(_) => Ok(()),
        }
    }
}

/// Pick a plausible default serial port, mirroring the platform quirks
/// the teacher's `default_serial_port` already works around.
pub fn default_serial_port() -> String {
    if let Ok(infos) = serialport::available_ports() {
        for info in infos {
            #[cfg(target_os = "macos")]
            if info.port_name.ends_with(".Bluetooth-Incoming-Port") {
                continue;
            }
            return info.port_name.clone();
        }
    }
    "/dev/ttyUSB0".to_owned()
}

pub fn open_serial(port_name: &str, baud: u32) -> anyhow::Result<ScopePort> {
    let mut port = serialport::new(port_name, baud).open()?;
    port.set_timeout(std::time::Duration::from_millis(1))?;
    Ok(ScopePort::Serial(BufWriter::new(port)))
}

pub fn open_file(path: &str) -> anyhow::Result<ScopePort> {
    let file = std::fs::File::options().read(true).write(true).open(path)?;
    Ok(ScopePort::File(BufWriter::new(file)))
}

pub fn capture_bar() -> indicatif::ProgressBar {
    let bar = indicatif::ProgressBar::new(3000);
    bar.set_style(
        indicatif::ProgressStyle::with_template("({spinner}) [{wide_bar}] waiting for capture")
            .unwrap()
            .tick_strings(&["<<<  ", "<<  <", "<  <<", "  <<<", " <<< ", "-----"]),
    );
    bar
}

pub fn e_hexdump(prefix: &str, bytes: &[u8]) {
    for s in crate::hexdump::hexdump_iter(bytes) {
        if !prefix.is_empty() {
            eprintln!("{prefix} {s}");
        } else {
            eprintln!("{s}");
        }
    }
}

/// Tees every byte written/read through [`e_hexdump`] when `verbose`;
/// selected with `--debug`.
pub struct LoggedPort<T> {
    inner: T,
    verbose: bool,
}

impl<T> LoggedPort<T> {
    pub fn new(inner: T, verbose: bool) -> Self {
        Self { inner, verbose }
    }
}

impl<T: Read> Read for LoggedPort<T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if self.verbose && n > 0 {
            e_hexdump("<", &buf[..n]);
        }
        Ok(n)
    }
}

impl<T: Write> Write for LoggedPort<T> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        if self.verbose {
            e_hexdump(">", &buf[..n]);
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
