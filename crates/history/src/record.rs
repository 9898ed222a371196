//! Metric-value wire form and the record structures of list files.
//!
//! A list file is a chain of records, newest first. Each record names
//! a timestamp, its predecessor, an optional dictionary delta and a
//! *record array*: per `(group path, tag set)` a pointer to the
//! group's metrics segment.

use std::collections::BTreeMap;

use monsoon_model::{GroupName, Histogram, MetricMap, MetricName, MetricValue, SimpleGroup, TimePoint};

use crate::dictionary::{DictionaryDelta, StrvalDictionary};
use crate::segment::FileSegmentPtr;
use crate::xdr::{XdrRead, XdrWrite};
use crate::{Error, Result};

const KIND_BOOL: u32 = 0;
const KIND_INT: u32 = 1;
const KIND_FLOAT: u32 = 2;
const KIND_STRING: u32 = 3;
const KIND_HISTOGRAM: u32 = 4;
const KIND_EMPTY: u32 = 0x7fff_ffff;

pub fn decode_metric_value(
    reader: &mut impl XdrRead,
    strings: &StrvalDictionary,
) -> Result<MetricValue> {
    match reader.get_u32()? {
        KIND_BOOL => Ok(MetricValue::Bool(reader.get_bool()?)),
        KIND_INT => Ok(MetricValue::Int(reader.get_i64()?)),
        KIND_FLOAT => Ok(MetricValue::Flt(reader.get_f64()?)),
        KIND_STRING => {
            let s = strings.decode(reader.get_u32()?)?;
            Ok(MetricValue::Str(s.clone()))
        }
        KIND_HISTOGRAM => Ok(MetricValue::Histogram(decode_histogram(reader)?)),
        KIND_EMPTY => Ok(MetricValue::Empty),
        _ => Err(Error::EncodingRange("unknown metric value kind")),
    }
}

/// Write a metric value; strings go through the dictionary.
pub fn encode_metric_value(
    writer: &mut impl XdrWrite,
    value: &MetricValue,
    strings: &mut StrvalDictionary,
) -> Result<()> {
    match value {
        MetricValue::Empty => writer.put_u32(KIND_EMPTY),
        MetricValue::Bool(b) => {
            writer.put_u32(KIND_BOOL)?;
            writer.put_bool(*b)
        }
        MetricValue::Int(v) => {
            writer.put_u32(KIND_INT)?;
            writer.put_i64(*v)
        }
        MetricValue::Flt(v) => {
            writer.put_u32(KIND_FLOAT)?;
            writer.put_f64(*v)
        }
        MetricValue::Str(s) => {
            writer.put_u32(KIND_STRING)?;
            writer.put_u32(strings.encode(s)?)
        }
        MetricValue::Histogram(h) => {
            writer.put_u32(KIND_HISTOGRAM)?;
            encode_histogram(writer, h)
        }
    }
}

pub fn decode_histogram(reader: &mut impl XdrRead) -> Result<Histogram> {
    let mut h = Histogram::new();
    reader.accept_collection(
        |r| {
            let lo = r.get_f64()?;
            let hi = r.get_f64()?;
            let count = r.get_f64()?;
            Ok((lo, hi, count))
        },
        |(lo, hi, count)| h.add(lo, hi, count),
    )?;
    Ok(h)
}

pub fn encode_histogram(writer: &mut impl XdrWrite, h: &Histogram) -> Result<()> {
    writer.put_collection(h.buckets().iter(), |w, &(lo, hi, count)| {
        w.put_f64(lo)?;
        w.put_f64(hi)?;
        w.put_f64(count)
    })
}

/// One list record, as stored: `{ts, pred?, dict_delta?, records,
/// reserved}`.
#[derive(Clone, Debug)]
pub struct ListRecord {
    pub ts: TimePoint,
    pub pred: Option<FileSegmentPtr>,
    pub dict_delta: Option<FileSegmentPtr>,
    pub records: FileSegmentPtr,
    pub reserved: u32,
}

impl ListRecord {
    pub fn decode(reader: &mut impl XdrRead) -> Result<Self> {
        let ts = TimePoint::from_millis(reader.get_i64()?);
        let pred = reader.get_optional(FileSegmentPtr::decode)?;
        let dict_delta = reader.get_optional(FileSegmentPtr::decode)?;
        let records = FileSegmentPtr::decode(reader)?;
        let reserved = reader.get_u32()?;
        Ok(ListRecord {
            ts,
            pred,
            dict_delta,
            records,
            reserved,
        })
    }

    pub fn encode(&self, writer: &mut impl XdrWrite) -> Result<()> {
        writer.put_i64(self.ts.millis_since_epoch())?;
        writer.put_optional(self.pred, |w, p| p.encode(w))?;
        writer.put_optional(self.dict_delta, |w, p| p.encode(w))?;
        self.records.encode(writer)?;
        writer.put_u32(self.reserved)
    }
}

/// Decode the metrics segment of one group: `(path ref, value)` pairs.
pub fn decode_record_metrics(
    reader: &mut impl XdrRead,
    dict: &DictionaryDelta,
) -> Result<MetricMap> {
    let mut out = MetricMap::new();
    reader.accept_collection(
        |r| {
            let path_ref = r.get_u32()?;
            let name = MetricName::new(dict.decode_path(path_ref)?);
            let value = decode_metric_value(r, dict.strings())?;
            Ok((name, value))
        },
        |(name, value)| {
            out.insert(name, value);
        },
    )?;
    Ok(out)
}

pub fn encode_record_metrics(
    writer: &mut impl XdrWrite,
    metrics: &MetricMap,
    dict: &mut DictionaryDelta,
) -> Result<()> {
    // Resolve references up front; the writer closure would otherwise
    // fight the dictionary over the mutable borrow.
    let mut entries = Vec::with_capacity(metrics.len());
    for (name, value) in metrics {
        let path_ref = dict.encode_path(name.segments())?;
        entries.push((path_ref, value));
    }
    writer.put_collection(entries.into_iter(), |w, (path_ref, value)| {
        w.put_u32(path_ref)?;
        encode_metric_value(w, value, dict.strings_mut())
    })
}

/// Decode a record array: per group path, per tag set, the pointer to
/// that group's metrics segment.
pub fn decode_record_array(
    reader: &mut impl XdrRead,
    dict: &DictionaryDelta,
) -> Result<Vec<(GroupName, FileSegmentPtr)>> {
    let mut out = Vec::new();
    let n = reader.get_u32()?;
    for _ in 0..n {
        let path_ref = reader.get_u32()?;
        let path = SimpleGroup::new(dict.decode_path(path_ref)?);
        let tagged = reader.get_collection(|r| {
            let tag_ref = r.get_u32()?;
            let ptr = FileSegmentPtr::decode(r)?;
            Ok((tag_ref, ptr))
        })?;
        for (tag_ref, ptr) in tagged {
            let tags = dict.decode_tags(tag_ref)?;
            out.push((GroupName::new(path.clone(), tags), ptr));
        }
    }
    Ok(out)
}

pub fn encode_record_array(
    writer: &mut impl XdrWrite,
    groups: &[(GroupName, FileSegmentPtr)],
    dict: &mut DictionaryDelta,
) -> Result<()> {
    // Group by path reference, keeping tag references inside.
    let mut by_path: BTreeMap<u32, Vec<(u32, FileSegmentPtr)>> = BTreeMap::new();
    for (name, ptr) in groups {
        let path_ref = dict.encode_path(name.path().segments())?;
        let tag_ref = dict.encode_tags(name.tags())?;
        by_path.entry(path_ref).or_default().push((tag_ref, *ptr));
    }

    writer.put_collection(by_path.iter(), |w, (&path_ref, tagged)| {
        w.put_u32(path_ref)?;
        w.put_collection(tagged.iter(), |w, &(tag_ref, ptr)| {
            w.put_u32(tag_ref)?;
            ptr.encode(w)
        })
    })
}
