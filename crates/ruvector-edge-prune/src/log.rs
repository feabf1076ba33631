//! Training log.
//!
//! A column-oriented book of scalar series, one entry per logged step.
//! Columns missing from an entry repeat their previous value, so every
//! series always has exactly `t` points.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Least-squares trend of the tail of a series.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Trend {
    /// Fitted change per step
    pub slope: f64,
    /// Fitted value at the start of the window
    pub start: f64,
    /// Fitted value at the end of the window
    pub end: f64,
    /// `(start - end) / |start|`; positive when the series declines
    pub decline: f64,
    /// Slope divided by its standard error (infinite for a perfect fit)
    pub t_stat: f64,
}

/// Scalar series keyed by column, plus the early-termination counter.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TrainingLog {
    columns: Vec<String>,
    book: BTreeMap<String, Vec<f64>>,
    t: usize,
    /// Hysteresis counter of the early-termination check
    pub early_term_count: usize,
}

impl TrainingLog {
    /// Log with a fixed set of columns
    pub fn new<S: AsRef<str>>(columns: &[S]) -> Self {
        let columns: Vec<String> = columns.iter().map(|c| c.as_ref().to_string()).collect();
        let book = columns.iter().map(|c| (c.clone(), Vec::new())).collect();
        Self {
            columns,
            book,
            t: 0,
            early_term_count: 0,
        }
    }

    /// Column names in insertion order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of entries
    #[inline]
    pub fn t(&self) -> usize {
        self.t
    }

    /// Append one entry. Keys outside the column set are ignored; missing
    /// columns repeat their last value (0 before the first entry).
    pub fn add_entry(&mut self, entry: &[(&str, f64)]) {
        for column in &self.columns {
            let series = self.book.entry(column.clone()).or_default();
            let value = entry
                .iter()
                .find(|(k, _)| *k == column.as_str())
                .map(|(_, v)| *v)
                .or_else(|| series.last().copied())
                .unwrap_or(0.0);
            series.push(value);
        }
        self.t += 1;
    }

    /// Full series of a column
    pub fn series(&self, column: &str) -> Option<&[f64]> {
        self.book.get(column).map(Vec::as_slice)
    }

    /// Latest value of a column
    pub fn last(&self, column: &str) -> Option<f64> {
        self.book.get(column).and_then(|s| s.last().copied())
    }

    /// Linear-regression trend over the last `window` points of a column.
    ///
    /// Returns `None` when the column is unknown or shorter than the window.
    pub fn stat_sig_growth(&self, column: &str, window: usize) -> Option<Trend> {
        let series = self.series(column)?;
        if window < 2 || series.len() < window {
            return None;
        }
        let ys = &series[series.len() - window..];
        let n = window as f64;
        let x_mean = (n - 1.0) / 2.0;
        let y_mean = ys.iter().sum::<f64>() / n;

        let (mut sxy, mut sxx) = (0.0, 0.0);
        for (i, y) in ys.iter().enumerate() {
            let dx = i as f64 - x_mean;
            sxy += dx * (y - y_mean);
            sxx += dx * dx;
        }
        let slope = sxy / sxx;
        let start = y_mean - slope * x_mean;
        let end = start + slope * (n - 1.0);

        let rss: f64 = ys
            .iter()
            .enumerate()
            .map(|(i, y)| (y - (start + slope * i as f64)).powi(2))
            .sum();
        let se = (rss / (n - 2.0).max(1.0) / sxx).sqrt();
        let t_stat = if se > 0.0 {
            slope / se
        } else if slope == 0.0 {
            0.0
        } else {
            slope.signum() * f64::INFINITY
        };

        let decline = if start.abs() > f64::EPSILON {
            (start - end) / start.abs()
        } else {
            start - end
        };

        Some(Trend {
            slope,
            start,
            end,
            decline,
            t_stat,
        })
    }
}
