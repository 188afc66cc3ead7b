//! Regression test for the stream file decoder
//!
//! Reference capture: 30500 rows of eight channels, first `i0` sample
//! -2512861. The file is synthesised with the same shape.

use flyscan::decoder::{self, ApbSettings, CHANNEL_NAMES, FRACTION_SCALE};
use flyscan::error::DaqError;
use flyscan::hardware::apb::NUM_CHANNELS;
use flyscan::hardware::mock::{write_stream_files, SYNTHETIC_I0_ROW0, SYNTHETIC_START_SECONDS};
use tempfile::TempDir;

const ROWS: usize = 30_500;

fn write_capture(dir: &TempDir) -> std::path::PathBuf {
    let bin = dir.path().join("ff2df6b8-eff5-4bb5-9718-69698ab6fa3c.bin");
    let mut settings = ApbSettings::new(NUM_CHANNELS, 10.0);
    settings.gains = vec![5, 5, 5, 5, 0, 0, 0, 0];
    settings.trigger_timestamp = 1_600_000_000.5;
    write_stream_files(&bin, &decoder::metadata_path(&bin), &settings, ROWS).unwrap();
    bin
}

#[test]
fn test_decode_reference_shape() {
    let dir = TempDir::new().unwrap();
    let bin = write_capture(&dir);

    let run = decoder::decode(&bin).unwrap();
    assert_eq!(run.table.shape(), (30_500, 9));

    let mut expected = vec!["timestamp".to_string()];
    expected.extend(CHANNEL_NAMES.iter().map(|s| s.to_string()));
    assert_eq!(run.table.column_names(), expected.as_slice());

    assert_eq!(run.table.column("i0").unwrap()[0], -2_512_861.0);
    assert_eq!(run.table.column("i0").unwrap()[0], f64::from(SYNTHETIC_I0_ROW0));
    assert_eq!(run.settings.gains[0], 5);
    assert_eq!(run.settings.trigger_timestamp, 1_600_000_000.5);
}

#[test]
fn test_timestamps_are_monotonic_and_reconstructed() {
    let dir = TempDir::new().unwrap();
    let bin = write_capture(&dir);
    let run = decoder::decode(&bin).unwrap();

    let ts = run.table.column("timestamp").unwrap();
    assert_eq!(ts[0], f64::from(SYNTHETIC_START_SECONDS));
    assert!(ts.windows(2).all(|w| w[1] > w[0]));
    // One millisecond per row, within the f64 resolution at epoch scale.
    assert!((ts[1] - ts[0] - 1e-3).abs() < 1e-6);
    let ticks_per_ms = (1e-3 / FRACTION_SCALE).round();
    assert!(ticks_per_ms > 124_000.0 && ticks_per_ms < 125_000.0);
}

#[test]
fn test_missing_metadata_names_path() {
    let dir = TempDir::new().unwrap();
    let bin = write_capture(&dir);
    std::fs::remove_file(decoder::metadata_path(&bin)).unwrap();

    let err = decoder::decode(&bin).unwrap_err();
    assert!(matches!(err, DaqError::MissingMetadata { .. }));
    assert!(err.to_string().contains(".txt"));
}

#[test]
fn test_truncated_file_is_malformed() {
    let dir = TempDir::new().unwrap();
    let bin = write_capture(&dir);
    let mut bytes = std::fs::read(&bin).unwrap();
    bytes.truncate(bytes.len() - 4);
    std::fs::write(&bin, bytes).unwrap();

    let err = decoder::decode(&bin).unwrap_err();
    assert!(matches!(err, DaqError::MalformedFile { .. }));
    assert!(err.to_string().contains("ff2df6b8"));
}
