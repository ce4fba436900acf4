// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Spill file for readings left unacknowledged at shutdown.
//!
//! One JSON reading per line. The file is replaced atomically (temp file +
//! rename) so a crash never leaves a half-written spill behind. It is kept
//! after replay and only removed by a shutdown with nothing left to spill;
//! replaying it twice is harmless because commits are idempotent.

use crate::error::ServiceError;
use crate::reading::Reading;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Replace the spill file with `readings`.
pub fn write_spill(path: &Path, readings: &[Reading]) -> Result<usize, ServiceError> {
    let tmp = temp_path(path);

    {
        let mut out = BufWriter::new(File::create(&tmp)?);
        for reading in readings {
            serde_json::to_writer(&mut out, reading)
                .map_err(|e| ServiceError::Spill(format!("encode failed: {}", e)))?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
    }

    fs::rename(&tmp, path)?;
    tracing::info!(path = %path.display(), readings = readings.len(), "Spilled unacknowledged readings");
    Ok(readings.len())
}

/// Load spilled readings. A missing file yields nothing; malformed lines are
/// skipped with a warning.
pub fn read_spill(path: &Path) -> Result<Vec<Reading>, ServiceError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut readings = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Reading>(&line) {
            Ok(reading) => readings.push(reading),
            Err(e) => tracing::warn!(
                path = %path.display(),
                line = number + 1,
                "Skipping malformed spill entry: {}",
                e
            ),
        }
    }

    Ok(readings)
}

/// Delete the spill file if present.
pub fn remove_spill(path: &Path) -> Result<(), ServiceError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::TagValue;

    fn reading(sequence: u64) -> Reading {
        Reading {
            source: "Bottom Cover Module".to_string(),
            tag: "ns=2;s=|var|CECC-LK.Application.FBs.udiONo".to_string(),
            value: TagValue::Int(4711),
            timestamp_ns: 1_700_000_000_000_000_000,
            monotonic_ns: 42,
            sequence,
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let readings = read_spill(&dir.path().join("none.jsonl")).unwrap();
        assert!(readings.is_empty());
    }

    #[test]
    fn test_write_replaces_previous_spill() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spill.jsonl");

        write_spill(&path, &[reading(1), reading(2), reading(3)]).unwrap();
        write_spill(&path, &[reading(7)]).unwrap();

        let back = read_spill(&path).unwrap();
        assert_eq!(back, vec![reading(7)]);
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_non_finite_values_survive_spill() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spill.jsonl");

        let spilled: Vec<Reading> = [f64::NAN, f64::INFINITY, f64::NEG_INFINITY]
            .into_iter()
            .enumerate()
            .map(|(i, value)| Reading {
                value: TagValue::Float(value),
                ..reading(7 + i as u64)
            })
            .collect();
        assert_eq!(write_spill(&path, &spilled).unwrap(), 3);

        let back = read_spill(&path).unwrap();
        assert_eq!(back.len(), 3);
        for (original, restored) in spilled.iter().zip(&back) {
            assert_eq!(restored.sequence, original.sequence);
            assert!(restored.value.same_as(&original.value));
        }
        assert!(matches!(back[0].value, TagValue::Float(v) if v.is_nan()));
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spill.jsonl");
        let good = serde_json::to_string(&reading(5)).unwrap();
        fs::write(&path, format!("{}\nnot json\n\n{}\n", good, good)).unwrap();

        assert_eq!(read_spill(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spill.jsonl");
        write_spill(&path, &[reading(1)]).unwrap();

        remove_spill(&path).unwrap();
        remove_spill(&path).unwrap();
        assert!(!path.exists());
    }
}
