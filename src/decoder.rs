//! APB stream file decoder
//!
//! A streaming run leaves two files on the box:
//!
//! - `<base>.bin`: little-endian `i32` rows of `[ch_1 .. ch_n, seconds, ticks]`
//! - `<base>.txt`: six `key: value` lines (channel count, gains, offsets,
//!   clock divider, sample rate, trigger timestamp)
//!
//! [`decode`] turns the pair into a [`RecordTable`] whose first column is the
//! Unix timestamp `seconds + ticks * FRACTION_SCALE` followed by one column
//! per analog channel. Channel values pass through unmodified; gains and
//! offsets are reported in [`ApbSettings`] but not applied.
//!
//! Decoding is a pure function of the two files.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use bytes::Buf;
use tracing::debug;

use crate::error::{AppResult, DaqError};

/// Seconds per tick of the fractional timestamp counter.
pub const FRACTION_SCALE: f64 = 8.0051232e-9;

/// Names of the first eight channel columns.
pub const CHANNEL_NAMES: [&str; 8] = ["i0", "it", "ir", "iff", "aux1", "aux2", "aux3", "aux4"];

/// Name of the derived timestamp column.
pub const TIMESTAMP_COLUMN: &str = "timestamp";

/// Largest channel count accepted from a settings file.
pub const MAX_CHANNELS: usize = 64;

const METADATA_LINES: usize = 6;
const IN_MEMORY: &str = "<in-memory>";

/// Acquisition settings stored next to a stream file.
#[derive(Debug, Clone, PartialEq)]
pub struct ApbSettings {
    /// Number of analog channels per row.
    pub num_channels: usize,
    /// Amplifier gain code per channel.
    pub gains: Vec<i64>,
    /// Offset code per channel.
    pub offsets: Vec<i64>,
    /// Clock divider.
    pub clock_divider: f64,
    /// Sample rate in kHz.
    pub sample_rate_khz: f64,
    /// Unix time of the trigger.
    pub trigger_timestamp: f64,
}

impl ApbSettings {
    /// Settings for `num_channels` channels with unit gains and zero offsets.
    pub fn new(num_channels: usize, sample_rate_khz: f64) -> Self {
        Self {
            num_channels,
            gains: vec![1; num_channels],
            offsets: vec![0; num_channels],
            clock_divider: 1.0,
            sample_rate_khz,
            trigger_timestamp: 0.0,
        }
    }

    /// `i32` values per raw row.
    pub fn row_width(&self) -> usize {
        self.num_channels.saturating_add(2)
    }

    /// Reject layouts no box produces. `path` is only used in error messages.
    pub fn check(&self, path: &Path) -> AppResult<()> {
        let malformed = |reason: String| DaqError::MalformedFile {
            path: path.to_path_buf(),
            reason,
        };
        if self.num_channels == 0 || self.num_channels > MAX_CHANNELS {
            return Err(malformed(format!(
                "channel count {} outside 1..={}",
                self.num_channels, MAX_CHANNELS
            )));
        }
        if self.gains.len() != self.num_channels || self.offsets.len() != self.num_channels {
            return Err(malformed(format!(
                "{} channels but {} gains and {} offsets",
                self.num_channels,
                self.gains.len(),
                self.offsets.len()
            )));
        }
        Ok(())
    }

    /// Parse the text form. `path` is only used in error messages.
    pub fn parse(text: &str, path: &Path) -> AppResult<Self> {
        let lines: Vec<&str> = text.lines().map(str::trim).collect();
        if lines.len() < METADATA_LINES {
            return Err(DaqError::MissingMetadata {
                path: path.to_path_buf(),
                reason: format!(
                    "expected {} metadata lines, found {}",
                    METADATA_LINES,
                    lines.len()
                ),
            });
        }

        let malformed = |line: usize, what: &str| DaqError::MalformedFile {
            path: path.to_path_buf(),
            reason: format!("line {}: invalid {}: '{}'", line + 1, what, lines[line]),
        };
        let value = |line: usize, what: &str| {
            lines[line]
                .split_once(':')
                .map(|(_, v)| v.trim())
                .ok_or_else(|| malformed(line, what))
        };
        let int_list = |line: usize, what: &str| -> AppResult<Vec<i64>> {
            value(line, what)?
                .split(',')
                .map(|x| x.trim().parse::<i64>().map_err(|_| malformed(line, what)))
                .collect()
        };

        let num_channels = value(0, "channel count")?
            .parse::<usize>()
            .map_err(|_| malformed(0, "channel count"))?;
        let gains = int_list(1, "gains")?;
        let offsets = int_list(2, "offsets")?;
        let clock_divider = value(3, "clock divider")?
            .parse::<f64>()
            .map_err(|_| malformed(3, "clock divider"))?;
        let sample_rate_khz = value(4, "sample rate")?
            .parse::<f64>()
            .map_err(|_| malformed(4, "sample rate"))?;
        let trigger_timestamp = value(5, "trigger timestamp")?
            .replace(',', ".")
            .parse::<f64>()
            .map_err(|_| malformed(5, "trigger timestamp"))?;

        let settings = Self {
            num_channels,
            gains,
            offsets,
            clock_divider,
            sample_rate_khz,
            trigger_timestamp,
        };
        settings.check(path)?;
        Ok(settings)
    }

    /// Read and parse a settings file.
    pub fn read(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| DaqError::MissingMetadata {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&text, path)
    }

    /// Text form as written by the box.
    pub fn to_text(&self) -> String {
        let join = |values: &[i64]| {
            values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        let mut text = String::new();
        let _ = writeln!(text, "NumChannels: {}", self.num_channels);
        let _ = writeln!(text, "Gains: {}", join(&self.gains));
        let _ = writeln!(text, "Offsets: {}", join(&self.offsets));
        let _ = writeln!(text, "FAdiv: {}", self.clock_divider);
        let _ = writeln!(text, "FArate: {}", self.sample_rate_khz);
        let _ = writeln!(text, "TriggerTimestamp: {}", self.trigger_timestamp);
        text
    }
}

/// Name of the `index`-th channel column (0-based).
pub fn channel_name(index: usize) -> String {
    CHANNEL_NAMES
        .get(index)
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("ch{}", index + 1))
}

/// Row-aligned named `f64` columns.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordTable {
    names: Vec<String>,
    columns: Vec<Vec<f64>>,
}

impl RecordTable {
    /// `(rows, columns)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.num_rows(), self.columns.len())
    }

    /// Number of rows.
    pub fn num_rows(&self) -> usize {
        self.columns.first().map(Vec::len).unwrap_or(0)
    }

    /// Column names in order.
    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    /// Column values by name.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.columns[i].as_slice())
    }

    /// One row across all columns.
    pub fn row(&self, index: usize) -> Option<Vec<f64>> {
        if index >= self.num_rows() {
            return None;
        }
        Some(self.columns.iter().map(|c| c[index]).collect())
    }
}

/// Settings plus decoded table of one stream file.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRun {
    /// Parsed metadata.
    pub settings: ApbSettings,
    /// Decoded samples.
    pub table: RecordTable,
}

/// Settings file that belongs to a `.bin` file.
pub fn metadata_path(bin_path: &Path) -> PathBuf {
    bin_path.with_extension("txt")
}

/// Decode a `.bin` file and its sibling `.txt`.
pub fn decode(bin_path: &Path) -> AppResult<DecodedRun> {
    let settings = ApbSettings::read(&metadata_path(bin_path))?;
    let data = std::fs::read(bin_path)?;
    let table = decode_raw(&settings, &data, bin_path)?;
    debug!(
        path = %bin_path.display(),
        rows = table.num_rows(),
        "decoded stream file"
    );
    Ok(DecodedRun { settings, table })
}

/// Decode raw bytes already in memory.
pub fn decode_bytes(settings: &ApbSettings, data: &[u8]) -> AppResult<RecordTable> {
    decode_raw(settings, data, Path::new(IN_MEMORY))
}

fn decode_raw(settings: &ApbSettings, data: &[u8], path: &Path) -> AppResult<RecordTable> {
    settings.check(path)?;
    let width = settings.row_width();
    let row_bytes = width
        .checked_mul(std::mem::size_of::<i32>())
        .ok_or_else(|| DaqError::MalformedFile {
            path: path.to_path_buf(),
            reason: format!("row of {} values overflows", width),
        })?;
    if data.len() % row_bytes != 0 {
        return Err(DaqError::MalformedFile {
            path: path.to_path_buf(),
            reason: format!(
                "{} bytes is not a multiple of the {}-byte row ({} channels + 2)",
                data.len(),
                row_bytes,
                settings.num_channels
            ),
        });
    }

    let rows = data.len() / row_bytes;
    let mut names = Vec::with_capacity(settings.num_channels + 1);
    names.push(TIMESTAMP_COLUMN.to_string());
    names.extend((0..settings.num_channels).map(channel_name));
    let mut columns = vec![Vec::with_capacity(rows); settings.num_channels + 1];

    let mut buf = data;
    let mut raw = vec![0i32; width];
    for _ in 0..rows {
        for value in raw.iter_mut() {
            *value = buf.get_i32_le();
        }
        let seconds = f64::from(raw[width - 2]);
        let ticks = f64::from(raw[width - 1]);
        columns[0].push(seconds + ticks * FRACTION_SCALE);
        for (channel, value) in raw[..settings.num_channels].iter().enumerate() {
            columns[channel + 1].push(f64::from(*value));
        }
    }

    Ok(RecordTable { names, columns })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn encode(rows: &[[i32; 4]]) -> Vec<u8> {
        let mut buf = Vec::new();
        for row in rows {
            for v in row {
                buf.put_i32_le(*v);
            }
        }
        buf
    }

    #[test]
    fn decodes_timestamp_and_channels() {
        let settings = ApbSettings::new(2, 10.0);
        let data = encode(&[[5, -7, 100, 0], [6, -8, 100, 124_920_000]]);
        let table = decode_bytes(&settings, &data).unwrap();

        assert_eq!(table.shape(), (2, 3));
        assert_eq!(table.column_names(), &["timestamp", "i0", "it"]);
        assert_eq!(table.column("i0").unwrap(), &[5.0, 6.0]);
        assert_eq!(table.column("it").unwrap(), &[-7.0, -8.0]);
        let ts = table.column("timestamp").unwrap();
        assert_eq!(ts[0], 100.0);
        assert!((ts[1] - (100.0 + 124_920_000.0 * FRACTION_SCALE)).abs() < 1e-9);
        assert_eq!(table.row(1).unwrap()[1], 6.0);
        assert!(table.row(2).is_none());
    }

    #[test]
    fn partial_row_is_malformed() {
        let settings = ApbSettings::new(2, 10.0);
        let mut data = encode(&[[1, 2, 3, 4]]);
        data.extend_from_slice(&[0, 0, 0, 0]);
        let err = decode_bytes(&settings, &data).unwrap_err();
        assert!(matches!(err, DaqError::MalformedFile { .. }));
    }

    #[test]
    fn channels_beyond_eight_are_numbered() {
        assert_eq!(channel_name(0), "i0");
        assert_eq!(channel_name(7), "aux4");
        assert_eq!(channel_name(8), "ch9");
        assert_eq!(channel_name(9), "ch10");
    }

    #[test]
    fn settings_parse_accepts_decimal_comma() {
        let text = "NumChannels: 8\nGains: 1,2,3,4,5,6,7,8\nOffsets: 0,0,0,0,0,0,0,-3\n\
                    FAdiv: 2\nFArate: 10\nTriggerTimestamp: 1600000000,25\n";
        let settings = ApbSettings::parse(text, Path::new("x.txt")).unwrap();
        assert_eq!(settings.num_channels, 8);
        assert_eq!(settings.gains[7], 8);
        assert_eq!(settings.offsets[7], -3);
        assert_eq!(settings.clock_divider, 2.0);
        assert_eq!(settings.sample_rate_khz, 10.0);
        assert_eq!(settings.trigger_timestamp, 1_600_000_000.25);
    }

    #[test]
    fn short_settings_is_missing_metadata() {
        let err = ApbSettings::parse("NumChannels: 8\n", Path::new("x.txt")).unwrap_err();
        assert!(matches!(err, DaqError::MissingMetadata { .. }));
    }

    #[test]
    fn bad_gain_is_malformed() {
        let text = "NumChannels: 2\nGains: 1,x\nOffsets: 0,0\nFAdiv: 1\nFArate: 10\nTriggerTimestamp: 0\n";
        let err = ApbSettings::parse(text, Path::new("x.txt")).unwrap_err();
        assert!(matches!(err, DaqError::MalformedFile { .. }));
        assert!(err.to_string().contains("x.txt"));
    }

    #[test]
    fn absurd_channel_count_is_malformed() {
        for count in [usize::MAX.to_string(), "1000000000".to_string(), "0".to_string()] {
            let text = format!(
                "NumChannels: {}\nGains: 1\nOffsets: 0\nFAdiv: 1\nFArate: 10\nTriggerTimestamp: 0\n",
                count
            );
            let err = ApbSettings::parse(&text, Path::new("x.txt")).unwrap_err();
            assert!(matches!(err, DaqError::MalformedFile { .. }), "{}", count);
            assert!(err.to_string().contains("x.txt"));
        }
    }

    #[test]
    fn gain_count_must_match_channels() {
        let text = "NumChannels: 3\nGains: 1,1\nOffsets: 0,0,0\nFAdiv: 1\nFArate: 10\nTriggerTimestamp: 0\n";
        let err = ApbSettings::parse(text, Path::new("x.txt")).unwrap_err();
        assert!(matches!(err, DaqError::MalformedFile { .. }));
        assert!(err.to_string().contains("2 gains"));
    }

    #[test]
    fn decode_rejects_unchecked_settings() {
        let mut settings = ApbSettings::new(2, 10.0);
        settings.num_channels = usize::MAX;
        let err = decode_bytes(&settings, &[]).unwrap_err();
        assert!(matches!(err, DaqError::MalformedFile { .. }));
        assert_eq!(settings.row_width(), usize::MAX);
    }

    #[test]
    fn settings_text_round_trips() {
        let settings = ApbSettings::new(8, 10.0);
        let parsed = ApbSettings::parse(&settings.to_text(), Path::new("x.txt")).unwrap();
        assert_eq!(parsed, settings);
    }
}
