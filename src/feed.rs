//! Price feed inputs for replay and the demo: CSV bars and a seeded random walk

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::trading_core::Bar;

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .with_context(|| format!("Failed to parse timestamp: {}", raw))?;
    Ok(naive.and_utc())
}

/// Read `timestamp,open,high,low,close` rows. The first `historical` bars are
/// flagged historical and only warm up the trend references.
pub fn read_bars<R: Read>(reader: R, historical: usize) -> Result<Vec<Bar>> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut bars = Vec::new();

    for (index, result) in csv_reader.deserialize().enumerate() {
        let row: CsvRow = result.with_context(|| format!("Failed to parse CSV row {}", index + 1))?;
        let timestamp = parse_timestamp(row.timestamp.trim())?;

        if ![row.open, row.high, row.low, row.close].iter().all(|v| v.is_finite()) {
            bail!("Row {} has a non-numeric price", index + 1);
        }
        if row.high < row.low {
            bail!("Row {} has high {} below low {}", index + 1, row.high, row.low);
        }

        let mut bar = Bar::live(index as u64, timestamp, row.open, row.high, row.low, row.close);
        bar.is_historical = index < historical;
        bars.push(bar);
    }

    Ok(bars)
}

/// Load bars from a CSV file
pub fn load_bars(path: &Path, historical: usize) -> Result<Vec<Bar>> {
    let file = File::open(path).with_context(|| format!("Failed to open file: {:?}", path))?;
    let bars = read_bars(BufReader::new(file), historical)?;
    tracing::debug!("Loaded {} bars from {:?}", bars.len(), path);
    Ok(bars)
}

/// Seeded random walk with occasional momentum bursts, on a 0.25 tick grid
pub fn synthetic_bars(
    seed: u64,
    count: usize,
    start_price: f64,
    start: DateTime<Utc>,
    step_secs: i64,
) -> Vec<Bar> {
    let mut rng = StdRng::seed_from_u64(seed);
    let snap = |price: f64| ((price * 4.0).round() / 4.0).max(0.25);

    let mut bars = Vec::with_capacity(count);
    let mut close = snap(start_price);

    for index in 0..count {
        let open = close;
        let mut change = rng.gen_range(-4.0..4.0);
        if rng.gen_bool(0.03) {
            // Burst away from the trend references
            change += if rng.gen_bool(0.5) { 40.0 } else { -40.0 };
        }
        close = snap(open + change);

        let high = snap(open.max(close) + rng.gen_range(0.0..3.0));
        let low = snap(open.min(close) - rng.gen_range(0.0..3.0));
        let timestamp = start + TimeDelta::seconds(step_secs * index as i64);

        bars.push(Bar::live(index as u64, timestamp, open, high, low, close));
    }

    bars
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_read_bars_marks_historical() {
        let data = "timestamp,open,high,low,close\n\
                    2025-03-03T14:30:00Z,20000,20010,19995,20005\n\
                    2025-03-03 14:31:00,20005,20020,20000,20018\n\
                    2025-03-03T14:32:00+00:00,20018,20030,20015,20025\n";

        let bars = read_bars(data.as_bytes(), 2).unwrap();
        assert_eq!(bars.len(), 3);
        assert!(bars[0].is_historical && bars[1].is_historical);
        assert!(!bars[2].is_historical);
        assert_eq!(bars[1].index, 1);
        assert_eq!(bars[1].timestamp, Utc.with_ymd_and_hms(2025, 3, 3, 14, 31, 0).unwrap());
        assert_eq!(bars[2].close, 20025.0);
    }

    #[test]
    fn test_read_bars_rejects_bad_rows() {
        let inverted = "timestamp,open,high,low,close\n2025-03-03T14:30:00Z,1,1,2,1\n";
        assert!(read_bars(inverted.as_bytes(), 0).is_err());

        let bad_time = "timestamp,open,high,low,close\nyesterday,1,2,1,1\n";
        assert!(read_bars(bad_time.as_bytes(), 0).is_err());
    }

    #[test]
    fn test_synthetic_bars_are_deterministic() {
        let start = Utc.with_ymd_and_hms(2025, 3, 3, 14, 30, 0).unwrap();
        let a = synthetic_bars(7, 50, 20000.0, start, 60);
        let b = synthetic_bars(7, 50, 20000.0, start, 60);

        assert_eq!(a, b);
        assert_eq!(a[49].timestamp, start + TimeDelta::minutes(49));
        assert!(a.iter().all(|bar| bar.high >= bar.low && bar.low > 0.0));
    }
}
