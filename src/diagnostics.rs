//! Optional binary dumps of intermediate detector data.
//!
//! The sinks are supplied by the caller; the core never opens files on its
//! own. The format is diagnostic, not a contract: a header of four `u32`
//! (stations, subbands, FFT size, polarizations) followed by records of
//! `{u32 time, u32 station, u32 subband}` and `fft_size × nr_pol` floats.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Destination for per-call intermediate power spectra.
pub trait IntermediateSink {
    fn write_header(
        &mut self,
        nr_stations: u32,
        nr_subbands: u32,
        fft_size: u32,
        nr_pol: u32,
    ) -> io::Result<()>;

    /// One record: `values` is laid out `[bin][pol]`.
    fn write_record(
        &mut self,
        time: u32,
        station: u32,
        subband: u32,
        values: &[f32],
    ) -> io::Result<()>;
}

/// File-backed sink writing the native-endian binary layout above.
pub struct BinaryDumpSink {
    writer: BufWriter<File>,
}

impl BinaryDumpSink {
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
        })
    }
}

impl IntermediateSink for BinaryDumpSink {
    fn write_header(
        &mut self,
        nr_stations: u32,
        nr_subbands: u32,
        fft_size: u32,
        nr_pol: u32,
    ) -> io::Result<()> {
        for value in [nr_stations, nr_subbands, fft_size, nr_pol] {
            self.writer.write_all(&value.to_ne_bytes())?;
        }
        self.writer.flush()
    }

    fn write_record(
        &mut self,
        time: u32,
        station: u32,
        subband: u32,
        values: &[f32],
    ) -> io::Result<()> {
        for value in [time, station, subband] {
            self.writer.write_all(&value.to_ne_bytes())?;
        }
        for value in values {
            self.writer.write_all(&value.to_ne_bytes())?;
        }
        self.writer.flush()
    }
}
