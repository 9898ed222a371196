use std::collections::BTreeMap;

use crate::{GroupName, MetricName, MetricValue, TimePoint};

/// Metrics of one group at one point in time.
pub type MetricMap = BTreeMap<MetricName, MetricValue>;

/// One group's measurements at one point in time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TimeSeriesValue {
    pub name: GroupName,
    pub metrics: MetricMap,
}

impl TimeSeriesValue {
    pub fn new(name: GroupName, metrics: MetricMap) -> Self {
        TimeSeriesValue { name, metrics }
    }
}

/// All measurements taken at one point in time, keyed by group.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TimeSeries {
    time: TimePoint,
    data: BTreeMap<GroupName, MetricMap>,
}

impl TimeSeries {
    pub fn new(time: TimePoint) -> Self {
        TimeSeries {
            time,
            data: BTreeMap::new(),
        }
    }

    pub fn with_data<I>(time: TimePoint, data: I) -> Self
    where
        I: IntoIterator<Item = (GroupName, MetricMap)>,
    {
        TimeSeries {
            time,
            data: data.into_iter().collect(),
        }
    }

    pub fn time(&self) -> TimePoint {
        self.time
    }

    pub fn data(&self) -> &BTreeMap<GroupName, MetricMap> {
        &self.data
    }

    pub fn insert(&mut self, name: GroupName, metrics: MetricMap) {
        self.data.insert(name, metrics);
    }

    /// Merge `other` (taken at the same time) into `self`.
    ///
    /// Groups present in both have their metric maps merged, with
    /// `other`'s values winning per metric. Used when reading files
    /// whose DISTINCT flag is unset and records at equal timestamps
    /// must be combined.
    pub fn merge(&mut self, other: TimeSeries) {
        debug_assert_eq!(self.time, other.time);
        for (name, metrics) in other.data {
            self.data.entry(name).or_default().extend(metrics);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
