// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::VecDeque;
use std::fmt;

use medians::Medianf64;
use rolling_stats;
use statistical;

/// Summary of a set of observations. Median values are only maintained for
/// the bounded recent window.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DescriptiveStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: Option<f64>,
    pub median_absolute_deviation: Option<f64>,
}

impl fmt::Display for DescriptiveStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n={} min={:.3} max={:.3} mean={:.3} sd={:.3}",
               self.count, self.min, self.max, self.mean, self.stddev)?;
        if let Some(median) = self.median {
            write!(f, " median={:.3}", median)?;
        }
        Ok(())
    }
}

/// Tracks a per-cycle quantity (inference latency, winning confidence) over
/// the last few cycles and over the whole run.
pub struct ValueStatsAccumulator {
    name: String,

    // Most recent values, oldest first.
    window: VecDeque<f64>,
    window_size: usize,

    // Running totals since startup.
    session: rolling_stats::Stats<f64>,
    session_count: usize,
}

impl ValueStatsAccumulator {
    pub fn new(name: &str, window_size: usize) -> Self {
        let window_size = window_size.max(1);
        ValueStatsAccumulator{
            name: name.to_string(),
            window: VecDeque::with_capacity(window_size),
            window_size,
            session: rolling_stats::Stats::<f64>::new(),
            session_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_value(&mut self, value: f64) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.session.update(value);
        self.session_count += 1;
    }

    /// Statistics over the recent window, including median and MAD.
    pub fn recent(&self) -> DescriptiveStats {
        let values: Vec<f64> = self.window.iter().copied().collect();
        describe(&values)
    }

    /// Statistics over every value seen. No median; that would mean keeping
    /// them all.
    pub fn session(&self) -> DescriptiveStats {
        if self.session_count == 0 {
            return DescriptiveStats::default();
        }
        DescriptiveStats{
            count: self.session_count,
            min: self.session.min,
            max: self.session.max,
            mean: self.session.mean,
            stddev: self.session.std_dev,
            median: None,
            median_absolute_deviation: None,
        }
    }
}

fn describe(values: &[f64]) -> DescriptiveStats {
    if values.is_empty() {
        return DescriptiveStats::default();
    }
    let mean = statistical::mean(values);
    let stddev = if values.len() > 1 {
        statistical::standard_deviation(values, Some(mean))
    } else {
        0.0
    };
    let median = values.medf_unchecked();
    DescriptiveStats{
        count: values.len(),
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        mean,
        stddev,
        median: Some(median),
        median_absolute_deviation: Some(values.madf(median)),
    }
}

// mod tests.
