//! Sensor input
//!
//! A [`SensorSource`] is whatever delivers raw readings: a live geolocation
//! feed, or a recorded capture replayed from disk. [`PositionSampler`] turns a
//! source into a lazy iterator of [`SensorReading`]s that can be restarted
//! when tracking is stopped and started again.
//!
//! ## Capture format
//!
//! [`JsonlSource`] reads one JSON object per line, tagged by `kind`:
//!
//! ```text
//! {"kind":"position","recorded_at":"2025-09-29T10:00:00Z","latitude":40.41,"longitude":-3.70,"speed":52.0}
//! {"kind":"motion","x":0.1,"y":0.3,"z":9.8}
//! ```
//!
//! Blank lines are skipped.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use crate::error::{Error, Result};
use crate::types::SensorReading;

/// A restartable producer of sensor readings.
pub trait SensorSource {
    /// Next reading, or `None` when the source has nothing more right now.
    ///
    /// A malformed reading is reported as `Some(Err(..))`; later calls keep
    /// going past it.
    fn next_reading(&mut self) -> Option<Result<SensorReading>>;

    /// Start over from the beginning of the feed.
    fn restart(&mut self) -> Result<()>;
}

/// Lazy, restartable sequence of readings pulled from a [`SensorSource`].
pub struct PositionSampler<S> {
    source: S,
    yielded: u64,
}

impl<S: SensorSource> PositionSampler<S> {
    pub fn new(source: S) -> Self {
        Self { source, yielded: 0 }
    }

    /// Restart the underlying source.
    pub fn restart(&mut self) -> Result<()> {
        self.source.restart()?;
        self.yielded = 0;
        tracing::debug!("Sampler restarted");
        Ok(())
    }

    /// Readings produced since creation or the last restart.
    pub fn yielded(&self) -> u64 {
        self.yielded
    }

    pub fn into_inner(self) -> S {
        self.source
    }
}

impl<S: SensorSource> Iterator for PositionSampler<S> {
    type Item = Result<SensorReading>;

    fn next(&mut self) -> Option<Self::Item> {
        let reading = self.source.next_reading()?;
        self.yielded += 1;
        Some(reading)
    }
}

/// Replays a JSON-lines capture.
pub struct JsonlSource<R> {
    reader: R,
    line: usize,
    buf: String,
}

impl JsonlSource<BufReader<File>> {
    /// Open a capture file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead + Seek> JsonlSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: 0,
            buf: String::new(),
        }
    }

    /// 1-based number of the last line read.
    pub fn line(&self) -> usize {
        self.line
    }
}

impl<R: BufRead + Seek> SensorSource for JsonlSource<R> {
    fn next_reading(&mut self) -> Option<Result<SensorReading>> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {
                    self.line += 1;
                    let trimmed = self.buf.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    return Some(serde_json::from_str(trimmed).map_err(|e| Error::Parse {
                        line: self.line,
                        message: e.to_string(),
                    }));
                }
                Err(e) => {
                    self.line += 1;
                    return Some(Err(Error::Io(e)));
                }
            }
        }
    }

    fn restart(&mut self) -> Result<()> {
        self.reader.seek(SeekFrom::Start(0))?;
        self.line = 0;
        Ok(())
    }
}

/// In-memory source over a fixed list of readings.
#[derive(Debug, Clone, Default)]
pub struct ReplaySource {
    readings: Vec<SensorReading>,
    next: usize,
}

impl ReplaySource {
    pub fn new(readings: Vec<SensorReading>) -> Self {
        Self { readings, next: 0 }
    }
}

impl SensorSource for ReplaySource {
    fn next_reading(&mut self) -> Option<Result<SensorReading>> {
        let reading = self.readings.get(self.next)?.clone();
        self.next += 1;
        Some(Ok(reading))
    }

    fn restart(&mut self) -> Result<()> {
        self.next = 0;
        Ok(())
    }
}
