use scopelib::sample_queue::CaptureConfig;

use crate::common;

pub trait ToolRun {
    fn run(&self) -> anyhow::Result<()>;
}

#[derive(clap::Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct ToolOptions {
    /// With no subcommand, captures one frame (the default action).
    #[command(subcommand)]
    pub command: Option<ToolCommand>,
    #[command(flatten)]
    pub capture: CaptureOpts,
}

#[derive(clap::Subcommand, Debug)]
pub enum ToolCommand {
    ListPorts(ListPortsOpts),
}

impl ToolRun for ToolOptions {
    fn run(&self) -> anyhow::Result<()> {
        match &self.command {
            Some(ToolCommand::ListPorts(o)) => o.run(),
            None => self.capture.run(),
        }
    }
}

#[derive(clap::Args, Debug)]
pub struct ListPortsOpts;

impl ToolRun for ListPortsOpts {
    fn run(&self) -> anyhow::Result<()> {
        for port in serialport::available_ports()? {
            if port.port_name == common::default_serial_port() {
                println!("* {}", port.port_name);
            } else {
                println!("  {}", port.port_name);
            }
            if let serialport::SerialPortType::UsbPort(usb) = port.port_type {
                println!("    - USB {:x}:{:x}", usb.vid, usb.pid);
                if let Some(serial_number) = usb.serial_number {
                    println!("    - S/N: {serial_number}");
                }
            }
        }
        Ok(())
    }
}

#[derive(clap::Args, Debug)]
pub struct CaptureOpts {
    /// Serial port, or USB serial number with `--usbhi`.
    #[arg(default_value_t = common::default_serial_port())]
    serialdevice: String,
    /// CSV file to write decoded samples to.
    #[arg(default_value = "capture.csv")]
    output_csv_file: String,

    #[arg(long, default_value_t = 125_000_000.0)]
    queryrate: f64,
    #[arg(long, default_value_t = 8)]
    bits: u8,
    #[arg(long, default_value_t = 0.01)]
    duration: f64,
    #[arg(long, default_value_t = 0.000002)]
    preface: f64,
    #[arg(long)]
    average: bool,

    /// Comma-separated list of channels to capture, e.g. `0,1`.
    #[arg(long, default_value = "0")]
    channels: String,

    #[arg(long, default_value = "dc1x")]
    ch0: String,
    #[arg(long, default_value = "dc1x")]
    ch1: String,
    #[arg(long, default_value = "dc1x")]
    ch2: String,
    #[arg(long, default_value = "dc1x")]
    ch3: String,

    #[arg(long)]
    ch0probe: Option<String>,
    #[arg(long)]
    ch1probe: Option<String>,
    #[arg(long)]
    ch2probe: Option<String>,
    #[arg(long)]
    ch3probe: Option<String>,

    #[arg(long)]
    ch0trigger: Option<String>,
    #[arg(long)]
    ch1trigger: Option<String>,
    #[arg(long)]
    ch2trigger: Option<String>,
    #[arg(long)]
    ch3trigger: Option<String>,

    /// Use a hi-speed USB synchronous-FIFO transport instead of a UART.
    #[arg(short, long)]
    usbhi: bool,
    /// List hi-speed USB modules and exit.
    #[arg(short, long)]
    listusb: bool,

    /// Hex-dump every byte written to and read from the transport.
    #[arg(long)]
    debug: bool,
}

impl CaptureOpts {
    fn modes(&self) -> [&str; 4] {
        [&self.ch0, &self.ch1, &self.ch2, &self.ch3]
    }

    fn probes(&self) -> [Option<&str>; 4] {
        [
            self.ch0probe.as_deref(),
            self.ch1probe.as_deref(),
            self.ch2probe.as_deref(),
            self.ch3probe.as_deref(),
        ]
    }

    fn triggers(&self) -> [Option<&str>; 4] {
        [
            self.ch0trigger.as_deref(),
            self.ch1trigger.as_deref(),
            self.ch2trigger.as_deref(),
            self.ch3trigger.as_deref(),
        ]
    }

    fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            query_rate_hz: self.queryrate,
            bits: self.bits,
            duration_s: self.duration,
            preface_s: self.preface,
            average: self.average,
        }
    }
}

impl ToolRun for CaptureOpts {
    fn run(&self) -> anyhow::Result<()> {
        if self.listusb {
            return list_usb();
        }

        let enabled: std::collections::HashSet<usize> = self
            .channels
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<usize>())
            .collect::<Result<_, _>>()?;
        if enabled.is_empty() {
            return Err(scopelib::error::ConfigError::NoChannelsEnabled.into());
        }

        let port = if self.usbhi {
            open_usbhi(&self.serialdevice)?
        } else {
            common::open_serial(&self.serialdevice, scopelib::orchestrator::BAUD)?
        };
        let port = common::LoggedPort::new(port, self.debug);

        let mut scope = scopelib::Scope::new(port);
        scope.set_warning_sink(|msg| eprintln!("warning: {msg}"));

        for (ch, (mode, probe)) in self.modes().into_iter().zip(self.probes()).enumerate() {
            let af = scope.channel_mut(ch);
            af.capturing = enabled.contains(&ch);
            af.set_mode_and_probe(mode, probe)?;
        }
        for (ch, trigger) in self.triggers().into_iter().enumerate() {
            if let Some(expr) = trigger {
                scope.channel_mut(ch).set_trigger(expr)?;
            }
        }

        let capture_config = self.capture_config();
        let queue_status =
            scopelib::SampleQueue::new(scopelib::orchestrator::FPGA_FREQ, &capture_config)?.status_line();

        let bar = common::capture_bar();
        let result = scope.run(&capture_config);
        bar.finish_and_clear();
        let result = result?;
        if !result.completed_normally {
            eprintln!("warning: capture ended before the hard wait ceiling; partial decode");
        }

        // read back after `run()`, which mirrors ch2/ch3's `capturing`
        // from ch0/ch1 when interleaved.
        let channel_statuses: Vec<String> =
            (0..4).map(|ch| scope.channel_mut(ch).status_line()).collect();

        let file = std::fs::File::create(&self.output_csv_file)?;
        let mut sink = crate::csv_sink::CsvSink::new(file);
        sink.write_header(&queue_status, &channel_statuses)?;
        sink.write_rows(&result.rows)?;
        sink.write_trailer()?;

        scope.cleanup()?;
        println!("wrote {} rows to {}", result.rows.len(), self.output_csv_file);
        Ok(())
    }
}

#[cfg(feature = "usbhi")]
fn open_usbhi(serial: &str) -> anyhow::Result<common::ScopePort> {
    Ok(common::ScopePort::UsbFifo(crate::usbhi::UsbFifoTransport::open(serial)?))
}

#[cfg(not(feature = "usbhi"))]
fn open_usbhi(_serial: &str) -> anyhow::Result<common::ScopePort> {
    anyhow::bail!("this build was compiled without hi-speed USB support (--features usbhi)")
}

#[cfg(feature = "usbhi")]
fn list_usb() -> anyhow::Result<()> {
    for serial in crate::usbhi::UsbFifoTransport::list()? {
        println!("{serial}");
    }
    Ok(())
}

#[cfg(not(feature = "usbhi"))]
fn list_usb() -> anyhow::Result<()> {
    anyhow::bail!("this build was compiled without hi-speed USB support (--features usbhi)")
}
