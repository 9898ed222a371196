//! The layered structures of tables-kind files.
//!
//! `file_data_tables` is a sequence of blocks; each block carries its
//! timestamps, a dictionary segment and a `tables` segment. `tables`
//! maps `(group ref, tag ref)` to a group table; a group table holds
//! the group's presence bitset and one `metric_table` per metric — a
//! columnar store of that metric's values over the block's timestamps.

use monsoon_model::{MetricValue, TimePoint};

use crate::bitset::Bitset;
use crate::dictionary::StrvalDictionary;
use crate::record::{decode_histogram, decode_metric_value, encode_histogram};
use crate::segment::FileSegmentPtr;
use crate::timestamp_delta::{decode_timestamp_delta, encode_timestamp_delta};
use crate::xdr::{XdrRead, XdrWrite};
use crate::{Error, Result};

/// One metric's values over a block's timestamps.
///
/// On the wire this is nine typed sub-columns in fixed order — bool,
/// i16, i32, i64, f64, string reference, histogram, empty, and a
/// catch-all of full metric values — each a presence bitset plus the
/// present values. Decoding folds them back into one optional-value
/// vector indexed by timestamp position.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricTable {
    values: Vec<Option<MetricValue>>,
}

impl MetricTable {
    pub fn from_values(values: Vec<Option<MetricValue>>) -> Self {
        MetricTable { values }
    }

    pub fn values(&self) -> &[Option<MetricValue>] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn decode(reader: &mut impl XdrRead, strings: &StrvalDictionary) -> Result<Self> {
        let mut table = MetricTable::default();

        table.apply_column(reader, |r| Ok(MetricValue::Bool(r.get_bool()?)))?;
        table.apply_column(reader, |r| Ok(MetricValue::Int(r.get_i16()?.into())))?;
        table.apply_column(reader, |r| Ok(MetricValue::Int(r.get_i32()?.into())))?;
        table.apply_column(reader, |r| Ok(MetricValue::Int(r.get_i64()?)))?;
        table.apply_column(reader, |r| Ok(MetricValue::Flt(r.get_f64()?)))?;
        table.apply_column(reader, |r| {
            Ok(MetricValue::Str(strings.decode(r.get_u32()?)?.clone()))
        })?;
        table.apply_column(reader, |r| Ok(MetricValue::Histogram(decode_histogram(r)?)))?;
        // The empty column carries no values, just presence.
        let empty_presence = Bitset::decode(reader)?;
        for idx in empty_presence.ones() {
            table.put(idx, MetricValue::Empty);
        }
        table.apply_column(reader, |r| decode_metric_value(r, strings))?;

        Ok(table)
    }

    fn apply_column<R: XdrRead>(
        &mut self,
        reader: &mut R,
        mut get: impl FnMut(&mut R) -> Result<MetricValue>,
    ) -> Result<()> {
        let presence = Bitset::decode(reader)?;
        let values = reader.get_collection(&mut get)?;
        if values.len() != presence.count_ones() {
            return Err(Error::EncodingRange(
                "metric column length does not match its presence bitset",
            ));
        }
        for (idx, value) in presence.ones().zip(values) {
            self.put(idx, value);
        }
        // Even an all-absent column widens the table to its length.
        if presence.len() > self.values.len() {
            self.values.resize(presence.len(), None);
        }
        Ok(())
    }

    fn put(&mut self, idx: usize, value: MetricValue) {
        if self.values.len() <= idx {
            self.values.resize(idx + 1, None);
        }
        self.values[idx] = Some(value);
    }

    pub fn encode(&self, writer: &mut impl XdrWrite, strings: &mut StrvalDictionary) -> Result<()> {
        let n = self.values.len();

        // Partition into the typed sub-columns; ints go into the
        // narrowest column that fits.
        let mut bools = ColumnBuilder::new(n);
        let mut i16s = ColumnBuilder::new(n);
        let mut i32s = ColumnBuilder::new(n);
        let mut i64s = ColumnBuilder::new(n);
        let mut flts = ColumnBuilder::new(n);
        let mut strs = ColumnBuilder::new(n);
        let mut hists = ColumnBuilder::new(n);
        let mut empties = ColumnBuilder::new(n);

        for (idx, value) in self.values.iter().enumerate() {
            match value {
                None => {}
                Some(MetricValue::Bool(_)) => bools.set(idx, value),
                Some(MetricValue::Int(v)) => {
                    if i16::try_from(*v).is_ok() {
                        i16s.set(idx, value)
                    } else if i32::try_from(*v).is_ok() {
                        i32s.set(idx, value)
                    } else {
                        i64s.set(idx, value)
                    }
                }
                Some(MetricValue::Flt(_)) => flts.set(idx, value),
                Some(MetricValue::Str(_)) => strs.set(idx, value),
                Some(MetricValue::Histogram(_)) => hists.set(idx, value),
                Some(MetricValue::Empty) => empties.set(idx, value),
            }
        }

        bools.emit(writer, |w, v| match v {
            MetricValue::Bool(b) => w.put_bool(*b),
            _ => unreachable!(),
        })?;
        i16s.emit(writer, |w, v| match v {
            MetricValue::Int(i) => w.put_i16(*i as i16),
            _ => unreachable!(),
        })?;
        i32s.emit(writer, |w, v| match v {
            MetricValue::Int(i) => w.put_i32(*i as i32),
            _ => unreachable!(),
        })?;
        i64s.emit(writer, |w, v| match v {
            MetricValue::Int(i) => w.put_i64(*i),
            _ => unreachable!(),
        })?;
        flts.emit(writer, |w, v| match v {
            MetricValue::Flt(f) => w.put_f64(*f),
            _ => unreachable!(),
        })?;
        {
            let ColumnBuilder { presence, values } = strs;
            presence.encode(writer)?;
            writer.put_collection(values.into_iter(), |w, v| match v {
                MetricValue::Str(s) => w.put_u32(strings.encode(s)?),
                _ => unreachable!(),
            })?;
        }
        hists.emit(writer, |w, v| match v {
            MetricValue::Histogram(h) => encode_histogram(w, h),
            _ => unreachable!(),
        })?;
        // Empty column: presence only.
        empties.presence.encode(writer)?;
        // Catch-all column: nothing ends up here when encoding.
        Bitset::from_bits(vec![false; n]).encode(writer)?;
        writer.put_u32(0)?; // Zero-length value collection.

        Ok(())
    }
}

struct ColumnBuilder<'a> {
    presence: Bitset,
    values: Vec<&'a MetricValue>,
}

impl<'a> ColumnBuilder<'a> {
    fn new(n: usize) -> Self {
        ColumnBuilder {
            presence: Bitset::from_bits(vec![false; n]),
            values: Vec::new(),
        }
    }

    fn set(&mut self, idx: usize, value: &'a Option<MetricValue>) {
        self.presence.set(idx, true);
        self.values.push(value.as_ref().unwrap());
    }

    fn emit<W: XdrWrite>(
        self,
        writer: &mut W,
        mut put: impl FnMut(&mut W, &MetricValue) -> Result<()>,
    ) -> Result<()> {
        self.presence.encode(writer)?;
        writer.put_collection(self.values.into_iter(), |w, v| put(w, v))
    }
}

/// One group's tables: its presence over the block timestamps, plus
/// per metric (by path reference) the pointer to its metric table.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupTable {
    pub presence: Bitset,
    /// Sorted by metric reference, deduplicated.
    pub metrics: Vec<(u32, FileSegmentPtr)>,
}

impl GroupTable {
    pub fn decode(reader: &mut impl XdrRead) -> Result<Self> {
        let presence = Bitset::decode(reader)?;
        let mut metrics = reader.get_collection(|r| {
            let metric_ref = r.get_u32()?;
            let ptr = FileSegmentPtr::decode(r)?;
            Ok((metric_ref, ptr))
        })?;
        metrics.sort_by_key(|&(metric_ref, _)| metric_ref);
        metrics.dedup_by_key(|&mut (metric_ref, _)| metric_ref);
        Ok(GroupTable { presence, metrics })
    }

    pub fn encode(&self, writer: &mut impl XdrWrite) -> Result<()> {
        self.presence.encode(writer)?;
        writer.put_collection(self.metrics.iter(), |w, &(metric_ref, ptr)| {
            w.put_u32(metric_ref)?;
            ptr.encode(w)
        })
    }
}

/// The `(group ref, tag ref) → group table` map of one block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tables {
    /// Sorted by `(group ref, tag ref)`, deduplicated.
    pub groups: Vec<((u32, u32), FileSegmentPtr)>,
}

impl Tables {
    pub fn decode(reader: &mut impl XdrRead) -> Result<Self> {
        let mut groups = Vec::new();
        reader.accept_collection(
            |r| {
                let grp_ref = r.get_u32()?;
                let tagged = r.get_collection(|r| {
                    let tag_ref = r.get_u32()?;
                    let ptr = FileSegmentPtr::decode(r)?;
                    Ok((tag_ref, ptr))
                })?;
                Ok((grp_ref, tagged))
            },
            |(grp_ref, tagged)| {
                for (tag_ref, ptr) in tagged {
                    groups.push(((grp_ref, tag_ref), ptr));
                }
            },
        )?;

        groups.sort_by_key(|&(key, _)| key);
        groups.dedup_by_key(|&mut (key, _)| key);
        Ok(Tables { groups })
    }

    pub fn encode(&self, writer: &mut impl XdrWrite) -> Result<()> {
        // Wire form nests tag entries under their group reference.
        let mut by_group: Vec<(u32, Vec<(u32, FileSegmentPtr)>)> = Vec::new();
        for &((grp_ref, tag_ref), ptr) in &self.groups {
            match by_group.last_mut() {
                Some((last, tagged)) if *last == grp_ref => tagged.push((tag_ref, ptr)),
                _ => by_group.push((grp_ref, vec![(tag_ref, ptr)])),
            }
        }

        writer.put_collection(by_group.into_iter(), |w, (grp_ref, tagged)| {
            w.put_u32(grp_ref)?;
            w.put_collection(tagged.into_iter(), |w, (tag_ref, ptr)| {
                w.put_u32(tag_ref)?;
                ptr.encode(w)
            })
        })
    }
}

/// One block of a tables file: timestamps plus pointers to the block's
/// dictionary and tables segments.
#[derive(Clone, Debug, PartialEq)]
pub struct TablesBlock {
    pub timestamps: Vec<TimePoint>,
    pub dict: FileSegmentPtr,
    pub tables: FileSegmentPtr,
}

impl TablesBlock {
    pub fn decode(reader: &mut impl XdrRead) -> Result<Self> {
        let timestamps = decode_timestamp_delta(reader)?;
        let dict = FileSegmentPtr::decode(reader)?;
        let tables = FileSegmentPtr::decode(reader)?;
        Ok(TablesBlock {
            timestamps,
            dict,
            tables,
        })
    }

    pub fn encode(&self, writer: &mut impl XdrWrite) -> Result<()> {
        encode_timestamp_delta(writer, &self.timestamps)?;
        self.dict.encode(writer)?;
        self.tables.encode(writer)
    }
}

pub fn decode_file_data_tables(reader: &mut impl XdrRead) -> Result<Vec<TablesBlock>> {
    reader.get_collection(TablesBlock::decode)
}

pub fn encode_file_data_tables(
    writer: &mut impl XdrWrite,
    blocks: &[TablesBlock],
) -> Result<()> {
    writer.put_collection(blocks.iter(), |w, b| b.encode(w))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::DictionaryDelta;
    use monsoon_model::Histogram;

    #[test]
    fn metric_table_roundtrip_mixed_kinds() {
        let mut dict = DictionaryDelta::new();
        let mut hist = Histogram::new();
        hist.add(1.0, 2.0, 3.0);

        let values = vec![
            Some(MetricValue::Bool(true)),
            None,
            Some(MetricValue::Int(7)),                  // i16 column
            Some(MetricValue::Int(1 << 20)),            // i32 column
            Some(MetricValue::Int(1 << 40)),            // i64 column
            Some(MetricValue::Flt(0.5)),
            Some(MetricValue::from("stringy")),
            Some(MetricValue::Histogram(hist)),
            Some(MetricValue::Empty),
            None,
        ];
        let table = MetricTable::from_values(values);

        let mut buf = Vec::new();
        table.encode(&mut buf, dict.strings_mut()).unwrap();
        let got = MetricTable::decode(&mut &buf[..], dict.strings()).unwrap();
        assert_eq!(got, table);
    }

    #[test]
    fn metric_table_presence_mismatch_is_rejected() {
        // Hand-build a bool column whose value count disagrees with
        // its presence bitset.
        let mut buf = Vec::new();
        Bitset::from_bits(vec![true, true])
            .encode(&mut buf)
            .unwrap();
        buf.put_u32(1).unwrap(); // One value where presence says two.
        buf.put_bool(true).unwrap();

        let dict = DictionaryDelta::new();
        assert!(matches!(
            MetricTable::decode(&mut &buf[..], dict.strings()),
            Err(Error::EncodingRange(_) | Error::EndOfStream),
        ));
    }

    #[test]
    fn group_table_roundtrip_sorts_metrics() {
        let table = GroupTable {
            presence: Bitset::from_bits(vec![true, false, true]),
            metrics: vec![
                (1, FileSegmentPtr::new(100, 4)),
                (5, FileSegmentPtr::new(200, 4)),
            ],
        };
        let mut buf = Vec::new();
        table.encode(&mut buf).unwrap();
        assert_eq!(GroupTable::decode(&mut &buf[..]).unwrap(), table);
    }

    #[test]
    fn tables_roundtrip() {
        let tables = Tables {
            groups: vec![
                ((1, 0), FileSegmentPtr::new(100, 4)),
                ((1, 2), FileSegmentPtr::new(200, 4)),
                ((3, 0), FileSegmentPtr::new(300, 4)),
            ],
        };
        let mut buf = Vec::new();
        tables.encode(&mut buf).unwrap();
        assert_eq!(Tables::decode(&mut &buf[..]).unwrap(), tables);
    }

    #[test]
    fn block_roundtrip() {
        let block = TablesBlock {
            timestamps: vec![TimePoint::from_millis(10), TimePoint::from_millis(20)],
            dict: FileSegmentPtr::new(64, 32),
            tables: FileSegmentPtr::new(128, 64),
        };
        let mut buf = Vec::new();
        encode_file_data_tables(&mut buf, std::slice::from_ref(&block)).unwrap();
        assert_eq!(
            decode_file_data_tables(&mut &buf[..]).unwrap(),
            vec![block],
        );
    }
}
