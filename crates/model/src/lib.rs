//! Value model of the monsoon time-series history store.
//!
//! A *time series* is a set of measurements taken at one point in time.
//! Each measurement is addressed by a [`GroupName`] (a path plus a tag
//! set) and a [`MetricName`] within that group, and carries a
//! [`MetricValue`].
//!
//! This crate only defines the value types, their ordering and their
//! hashing. Arithmetic over metric values lives in the (out of tree)
//! expression evaluator.

mod histogram;
mod metric_value;
mod name;
mod tags;
mod time_point;
mod time_series;

pub use histogram::Histogram;
pub use metric_value::MetricValue;
pub use name::{GroupName, MetricName, SimpleGroup};
pub use tags::Tags;
pub use time_point::{TimePoint, TimePointDelta};
pub use time_series::{MetricMap, TimeSeries, TimeSeriesValue};
