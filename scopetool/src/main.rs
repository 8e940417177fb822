pub mod cli;
pub mod common;
pub mod csv_sink;
pub mod hexdump;
#[cfg(feature = "usbhi")]
pub mod usbhi;

use cli::ToolRun;

fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let opts = cli::ToolOptions::parse();
    opts.run()
}
