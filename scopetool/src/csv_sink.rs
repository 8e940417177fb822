//! Buffered CSV writer for decoded capture rows: `;`-prefixed capture
//! metadata, a `time,ch0,ch1,ch2,ch3` column header, data rows, and a
//! trailing `; End of capture (N data lines)` line.

use std::io::{BufWriter, Write};

use scopelib::SampleRow;

pub struct CsvSink<W: Write> {
    out: BufWriter<W>,
    line_count: usize,
}

impl<W: Write> CsvSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: BufWriter::new(out),
            line_count: 0,
        }
    }

    /// Write the `;`-prefixed capture/channel metadata followed by the
    /// column header. `queue_status`/`channel_statuses` come from
    /// `SampleQueue::status_line`/`AfConfig::status_line`.
    pub fn write_header(&mut self, queue_status: &str, channel_statuses: &[String]) -> std::io::Result<()> {
        for line in queue_status.lines() {
            writeln!(self.out, "; {line}")?;
        }
        for status in channel_statuses {
            for line in status.lines() {
                writeln!(self.out, "; {line}")?;
            }
        }
        writeln!(self.out, "time,ch0,ch1,ch2,ch3")
    }

    pub fn write_row(&mut self, row: &SampleRow) -> std::io::Result<()> {
        writeln!(
            self.out,
            "{:.9},{:.6},{:.6},{:.6},{:.6}",
            row.time_s, row.channels[0], row.channels[1], row.channels[2], row.channels[3]
        )?;
        self.line_count += 1;
        Ok(())
    }

    pub fn write_rows(&mut self, rows: &[SampleRow]) -> std::io::Result<()> {
        for row in rows {
            self.write_row(row)?;
        }
        self.out.flush()
    }

    /// Close out the file with the count of data rows written so far.
    pub fn write_trailer(&mut self) -> std::io::Result<()> {
        writeln!(self.out, "; End of capture ({} data lines)", self.line_count)?;
        self.out.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_and_row_format() {
        let mut buf = Vec::new();
        {
            let mut sink = CsvSink::new(&mut buf);
            sink.write_header("Hz=125000000 interleave=0", &["channel0: capturing=1".to_owned()])
                .unwrap();
            sink.write_rows(&[SampleRow {
                time_s: 0.000000001,
                channels: [1.0, -1.0, 0.0, 0.0],
            }])
            .unwrap();
            sink.write_trailer().unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            "; Hz=125000000 interleave=0\n\
             ; channel0: capturing=1\n\
             time,ch0,ch1,ch2,ch3\n\
             0.000000001,1.000000,-1.000000,0.000000,0.000000\n\
             ; End of capture (1 data lines)\n"
        );
    }

    #[test]
    fn trailer_counts_only_written_rows() {
        let mut buf = Vec::new();
        {
            let mut sink = CsvSink::new(&mut buf);
            sink.write_header("", &[]).unwrap();
            sink.write_rows(&[
                SampleRow {
                    time_s: 0.0,
                    channels: [0.0; 4],
                },
                SampleRow {
                    time_s: 1.0,
                    channels: [0.0; 4],
                },
            ])
            .unwrap();
            sink.write_trailer().unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        assert!(text.ends_with("; End of capture (2 data lines)\n"));
    }
}
