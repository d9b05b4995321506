//! Aggregates computed over the points of a result group

use crate::{AggregateFunction, RawPoint, Timestamp};

/// Incremental aggregate over timestamped values
pub trait Accumulator: Send {
    /// Fold one point into the aggregate
    fn add(&mut self, timestamp: Timestamp, value: f64);

    /// Current result; `None` while undefined
    fn result(&self) -> Option<f64>;
}

/// A fresh accumulator for `function`
pub fn accumulator(function: AggregateFunction) -> Box<dyn Accumulator> {
    match function {
        AggregateFunction::Count => Box::<CountAccumulator>::default(),
        AggregateFunction::Sum => Box::<SumAccumulator>::default(),
        AggregateFunction::Mean => Box::<MeanAccumulator>::default(),
        AggregateFunction::Min => Box::<MinAccumulator>::default(),
        AggregateFunction::Max => Box::<MaxAccumulator>::default(),
        AggregateFunction::First => Box::<FirstAccumulator>::default(),
        AggregateFunction::Last => Box::<LastAccumulator>::default(),
        AggregateFunction::Stddev => Box::<StddevAccumulator>::default(),
    }
}

/// Aggregate a sequence of points in one pass
pub fn aggregate<'a>(
    function: AggregateFunction,
    points: impl IntoIterator<Item = &'a RawPoint>,
) -> Option<f64> {
    let mut acc = accumulator(function);
    for point in points {
        acc.add(point.timestamp, point.value);
    }
    acc.result()
}

#[derive(Debug, Default)]
pub struct CountAccumulator {
    count: u64,
}

impl Accumulator for CountAccumulator {
    fn add(&mut self, _timestamp: Timestamp, _value: f64) {
        self.count += 1;
    }

    fn result(&self) -> Option<f64> {
        Some(self.count as f64)
    }
}

#[derive(Debug, Default)]
pub struct SumAccumulator {
    sum: Option<f64>,
}

impl Accumulator for SumAccumulator {
    fn add(&mut self, _timestamp: Timestamp, value: f64) {
        *self.sum.get_or_insert(0.0) += value;
    }

    fn result(&self) -> Option<f64> {
        self.sum
    }
}

#[derive(Debug, Default)]
pub struct MeanAccumulator {
    sum: f64,
    count: u64,
}

impl Accumulator for MeanAccumulator {
    fn add(&mut self, _timestamp: Timestamp, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn result(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

#[derive(Debug, Default)]
pub struct MinAccumulator {
    min: Option<f64>,
}

impl Accumulator for MinAccumulator {
    fn add(&mut self, _timestamp: Timestamp, value: f64) {
        self.min = Some(self.min.map_or(value, |current| current.min(value)));
    }

    fn result(&self) -> Option<f64> {
        self.min
    }
}

#[derive(Debug, Default)]
pub struct MaxAccumulator {
    max: Option<f64>,
}

impl Accumulator for MaxAccumulator {
    fn add(&mut self, _timestamp: Timestamp, value: f64) {
        self.max = Some(self.max.map_or(value, |current| current.max(value)));
    }

    fn result(&self) -> Option<f64> {
        self.max
    }
}

/// Earliest point wins; ties keep the first seen
#[derive(Debug, Default)]
pub struct FirstAccumulator {
    value: Option<(Timestamp, f64)>,
}

impl Accumulator for FirstAccumulator {
    fn add(&mut self, timestamp: Timestamp, value: f64) {
        match self.value {
            Some((ts, _)) if ts <= timestamp => {}
            _ => self.value = Some((timestamp, value)),
        }
    }

    fn result(&self) -> Option<f64> {
        self.value.map(|(_, v)| v)
    }
}

/// Latest point wins; ties keep the last seen
#[derive(Debug, Default)]
pub struct LastAccumulator {
    value: Option<(Timestamp, f64)>,
}

impl Accumulator for LastAccumulator {
    fn add(&mut self, timestamp: Timestamp, value: f64) {
        match self.value {
            Some((ts, _)) if ts > timestamp => {}
            _ => self.value = Some((timestamp, value)),
        }
    }

    fn result(&self) -> Option<f64> {
        self.value.map(|(_, v)| v)
    }
}

/// Population standard deviation (Welford's algorithm)
#[derive(Debug, Default)]
pub struct StddevAccumulator {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Accumulator for StddevAccumulator {
    fn add(&mut self, _timestamp: Timestamp, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn result(&self) -> Option<f64> {
        (self.count > 1).then(|| (self.m2 / self.count as f64).sqrt())
    }
}
