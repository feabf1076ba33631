//! Diagnostic artifacts.
//!
//! Recorded steps write histogram and scatter summaries as JSON files into
//! the run directory instead of rendering plots.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::error::Result;

/// Fixed-width histogram over the finite values of a sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Histogram {
    /// Lower edge of the first bin
    pub lo: f32,
    /// Upper edge of the last bin
    pub hi: f32,
    /// Counts per bin
    pub counts: Vec<usize>,
    /// Non-finite values skipped
    pub skipped: usize,
}

impl Histogram {
    /// Bin `values` into `bins` equal-width buckets spanning their range.
    pub fn from_values(values: &[f32], bins: usize) -> Self {
        let bins = bins.max(1);
        let finite: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let skipped = values.len() - finite.len();
        if finite.is_empty() {
            return Self {
                lo: 0.0,
                hi: 0.0,
                counts: vec![0; bins],
                skipped,
            };
        }

        let lo = finite.iter().copied().fold(f32::INFINITY, f32::min);
        let hi = finite.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let width = (hi - lo) / bins as f32;
        let mut counts = vec![0; bins];
        for v in finite {
            let idx = if width > 0.0 {
                (((v - lo) / width) as usize).min(bins - 1)
            } else {
                0
            };
            counts[idx] += 1;
        }
        Self {
            lo,
            hi,
            counts,
            skipped,
        }
    }

    /// Total binned values
    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }
}

/// Paired series for a scatter summary.
#[derive(Debug, Clone, Serialize)]
pub struct Scatter {
    /// Horizontal values
    pub x: Vec<f32>,
    /// Vertical values
    pub y: Vec<f32>,
}

/// Serialize `value` as pretty JSON at `path`.
pub fn write_json<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}
