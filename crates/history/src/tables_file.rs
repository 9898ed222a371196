//! The tables kind: columnar blocks of time series.
//!
//! Reading materializes per-timestamp series from the presence bitsets
//! and metric columns; `emit` walks a filtered subset of the columns
//! instead and merges block outputs according to the SORTED/DISTINCT
//! flags.

use std::collections::BTreeMap;
use std::fs::File;
use std::sync::Arc;

use itertools::Itertools;

use monsoon_model::{
    GroupName, MetricMap, MetricName, MetricValue, SimpleGroup, Tags, TimePoint, TimeSeries,
};

use crate::cache::{next_parent_id, CacheKey, CacheOptions, CacheTag, CachedValue, DecodeCache, ParentId};
use crate::ctx::EncdecCtx;
use crate::dictionary::DictionaryDelta;
use crate::segment::FileSegmentPtr;
use crate::tables::{decode_file_data_tables, GroupTable, MetricTable, Tables, TablesBlock};
use crate::tsfile::{MimeHeader, TsfileHeader};
use crate::Result;

/// One emitted tuple: a timestamp and the filtered values at it.
pub type EmitEntry = (TimePoint, BTreeMap<(GroupName, MetricName), MetricValue>);

pub struct TsdataTables {
    fd: Arc<File>,
    mime: MimeHeader,
    hdr: TsfileHeader,
    ctx: EncdecCtx,
    cache: Arc<DecodeCache>,
    parent_id: ParentId,
}

impl TsdataTables {
    pub(crate) fn new(fd: Arc<File>, mime: MimeHeader, hdr: TsfileHeader) -> Self {
        let ctx = EncdecCtx::new(Arc::clone(&fd), hdr.flags);
        TsdataTables {
            fd,
            mime,
            hdr,
            ctx,
            cache: DecodeCache::new(CacheOptions::default()),
            parent_id: next_parent_id(),
        }
    }

    pub(crate) fn mime(&self) -> MimeHeader {
        self.mime
    }

    pub(crate) fn header(&self) -> TsfileHeader {
        self.hdr
    }

    pub fn fd(&self) -> &Arc<File> {
        &self.fd
    }

    fn is_sorted(&self) -> bool {
        self.hdr.flags.is_sorted()
    }

    fn is_distinct(&self) -> bool {
        self.hdr.flags.is_distinct()
    }

    fn blocks(&self) -> Result<Vec<TablesBlock>> {
        if self.hdr.fdt.is_null() {
            return Ok(Vec::new());
        }
        let mut reader = self.ctx.new_reader(self.hdr.fdt, true)?;
        let blocks = decode_file_data_tables(&mut reader)?;
        reader.finish()?;
        Ok(blocks)
    }

    fn block_dictionary(&self, block: &TablesBlock) -> Result<Arc<DictionaryDelta>> {
        let key = CacheKey {
            parent: self.parent_id,
            ptr: block.dict,
            tag: CacheTag::Dictionary,
        };
        let value = self.cache.get_or_decode(key, || {
            let mut reader = self.ctx.new_reader(block.dict, true)?;
            let mut dict = DictionaryDelta::new();
            dict.decode_update(&mut reader)?;
            reader.finish()?;
            let weight = block.dict.len() as usize * 4;
            Ok((CachedValue::Dictionary(Arc::new(dict)), weight))
        })?;
        match value {
            CachedValue::Dictionary(dict) => Ok(dict),
            _ => unreachable!("cache key carries the dictionary tag"),
        }
    }

    fn block_tables(&self, block: &TablesBlock) -> Result<Arc<Tables>> {
        let key = CacheKey {
            parent: self.parent_id,
            ptr: block.tables,
            tag: CacheTag::Tables,
        };
        let value = self.cache.get_or_decode(key, || {
            let mut reader = self.ctx.new_reader(block.tables, true)?;
            let tables = Tables::decode(&mut reader)?;
            reader.finish()?;
            let weight = 32 * (1 + tables.groups.len());
            Ok((CachedValue::Tables(Arc::new(tables)), weight))
        })?;
        match value {
            CachedValue::Tables(tables) => Ok(tables),
            _ => unreachable!("cache key carries the tables tag"),
        }
    }

    fn group_table(&self, ptr: FileSegmentPtr) -> Result<Arc<GroupTable>> {
        let key = CacheKey {
            parent: self.parent_id,
            ptr,
            tag: CacheTag::GroupTable,
        };
        let value = self.cache.get_or_decode(key, || {
            let mut reader = self.ctx.new_reader(ptr, true)?;
            let table = GroupTable::decode(&mut reader)?;
            reader.finish()?;
            let weight = 32 * (1 + table.metrics.len()) + table.presence.len() / 8;
            Ok((CachedValue::GroupTable(Arc::new(table)), weight))
        })?;
        match value {
            CachedValue::GroupTable(table) => Ok(table),
            _ => unreachable!("cache key carries the group-table tag"),
        }
    }

    fn metric_table(&self, ptr: FileSegmentPtr, dict: &DictionaryDelta) -> Result<Arc<MetricTable>> {
        let key = CacheKey {
            parent: self.parent_id,
            ptr,
            tag: CacheTag::MetricTable,
        };
        let value = self.cache.get_or_decode(key, || {
            let mut reader = self.ctx.new_reader(ptr, true)?;
            let table = MetricTable::decode(&mut reader, dict.strings())?;
            reader.finish()?;
            let weight = 48 * (1 + table.len());
            Ok((CachedValue::MetricTable(Arc::new(table)), weight))
        })?;
        match value {
            CachedValue::MetricTable(table) => Ok(table),
            _ => unreachable!("cache key carries the metric-table tag"),
        }
    }

    fn group_name(
        dict: &DictionaryDelta,
        grp_ref: u32,
        tag_ref: u32,
    ) -> Result<GroupName> {
        Ok(GroupName::new(
            SimpleGroup::new(dict.decode_path(grp_ref)?),
            dict.decode_tags(tag_ref)?,
        ))
    }

    pub(crate) fn read_all_raw(&self) -> Result<Vec<TimeSeries>> {
        let mut out = Vec::new();

        for block in self.blocks()? {
            let dict = self.block_dictionary(&block)?;
            let tables = self.block_tables(&block)?;

            let mut per_ts: Vec<TimeSeries> = block
                .timestamps
                .iter()
                .map(|&t| TimeSeries::new(t))
                .collect();

            for &((grp_ref, tag_ref), gt_ptr) in &tables.groups {
                let name = Self::group_name(&dict, grp_ref, tag_ref)?;
                let gt = self.group_table(gt_ptr)?;

                let mut metric_maps: Vec<MetricMap> =
                    vec![MetricMap::new(); block.timestamps.len()];
                for &(metric_ref, mt_ptr) in &gt.metrics {
                    let metric = MetricName::new(dict.decode_path(metric_ref)?);
                    let mt = self.metric_table(mt_ptr, &dict)?;
                    for (i, value) in mt
                        .values()
                        .iter()
                        .enumerate()
                        .take(block.timestamps.len())
                    {
                        if let Some(value) = value {
                            metric_maps[i].insert(metric.clone(), value.clone());
                        }
                    }
                }

                for (i, present) in gt.presence.iter().enumerate().take(per_ts.len()) {
                    if present {
                        per_ts[i].insert(name.clone(), std::mem::take(&mut metric_maps[i]));
                    }
                }
            }

            out.extend(per_ts);
        }
        Ok(out)
    }

    /// Emit filtered `(timestamp, values)` tuples over an inclusive
    /// time range.
    ///
    /// Blocks are walked sequentially when the file is SORTED and
    /// DISTINCT; merged when only DISTINCT; merged with combination of
    /// equal timestamps otherwise.
    pub fn emit(
        &self,
        tr_begin: Option<TimePoint>,
        tr_end: Option<TimePoint>,
        group_filter: impl Fn(&SimpleGroup, &Tags) -> bool,
        metric_filter: impl Fn(&MetricName) -> bool,
    ) -> Result<Vec<EmitEntry>> {
        let mut per_block: Vec<Vec<EmitEntry>> = Vec::new();

        for block in self.blocks()? {
            let dict = self.block_dictionary(&block)?;
            let tables = self.block_tables(&block)?;

            let in_range = |t: TimePoint| {
                tr_begin.map_or(true, |b| t >= b) && tr_end.map_or(true, |e| t <= e)
            };

            let mut maps: Vec<BTreeMap<(GroupName, MetricName), MetricValue>> =
                vec![BTreeMap::new(); block.timestamps.len()];

            for &((grp_ref, tag_ref), gt_ptr) in &tables.groups {
                let name = Self::group_name(&dict, grp_ref, tag_ref)?;
                if !group_filter(name.path(), name.tags()) {
                    continue;
                }
                let gt = self.group_table(gt_ptr)?;

                for &(metric_ref, mt_ptr) in &gt.metrics {
                    let metric = MetricName::new(dict.decode_path(metric_ref)?);
                    if !metric_filter(&metric) {
                        continue;
                    }
                    let mt = self.metric_table(mt_ptr, &dict)?;
                    for (i, value) in mt
                        .values()
                        .iter()
                        .enumerate()
                        .take(block.timestamps.len())
                    {
                        let (Some(value), true) = (value, in_range(block.timestamps[i])) else {
                            continue;
                        };
                        maps[i].insert((name.clone(), metric.clone()), value.clone());
                    }
                }
            }

            let entries: Vec<EmitEntry> = block
                .timestamps
                .iter()
                .zip(maps)
                .filter(|(_, map)| !map.is_empty())
                .map(|(&t, map)| (t, map))
                .collect();
            per_block.push(entries);
        }

        if self.is_sorted() && self.is_distinct() {
            return Ok(per_block.into_iter().flatten().collect());
        }

        if self.is_distinct() {
            // Merge sorted per-block streams.
            for entries in &mut per_block {
                entries.sort_by_key(|&(t, _)| t);
            }
            return Ok(per_block
                .into_iter()
                .kmerge_by(|x, y| x.0 < y.0)
                .collect());
        }

        // Merge and combine equal timestamps across all blocks.
        let mut all: Vec<EmitEntry> = per_block.into_iter().flatten().collect();
        all.sort_by_key(|&(t, _)| t);
        let mut combined: Vec<EmitEntry> = Vec::with_capacity(all.len());
        for (t, map) in all {
            match combined.last_mut() {
                Some((last_t, last_map)) if *last_t == t => last_map.extend(map),
                _ => combined.push((t, map)),
            }
        }
        Ok(combined)
    }

    /// Emit only the timestamps of the file within an inclusive range.
    pub fn emit_time(
        &self,
        tr_begin: Option<TimePoint>,
        tr_end: Option<TimePoint>,
    ) -> Result<Vec<TimePoint>> {
        let in_range = |t: &TimePoint| {
            tr_begin.map_or(true, |b| *t >= b) && tr_end.map_or(true, |e| *t <= e)
        };

        let mut per_block: Vec<Vec<TimePoint>> = Vec::new();
        for block in self.blocks()? {
            per_block.push(block.timestamps.iter().copied().filter(in_range).collect());
        }

        if self.is_sorted() && self.is_distinct() {
            return Ok(per_block.into_iter().flatten().collect());
        }

        if self.is_distinct() {
            for entries in &mut per_block {
                entries.sort();
            }
            return Ok(per_block.into_iter().kmerge().collect());
        }

        let mut all: Vec<TimePoint> = per_block.into_iter().flatten().collect();
        all.sort();
        all.dedup();
        Ok(all)
    }

    /// Drop cached decodes addressing `offset`.
    pub fn invalidate(&self, offset: u64) {
        self.cache.invalidate(self.parent_id, offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitset::Bitset;
    use crate::tables::{encode_file_data_tables, MetricTable as MetricTableData};
    use crate::tsfile::{write_header, Flags, Tsdata, HEADER_STORAGE_LEN};

    /// Build a tables file with one block per entry of `blocks`; each
    /// block is `(timestamps, groups)` with per-group metric columns.
    #[allow(clippy::type_complexity)]
    fn build_tables_file(
        flags: Flags,
        blocks: &[(
            Vec<i64>,
            Vec<(&str, &str, Vec<Option<MetricValue>>)>, // (group, metric, column)
        )],
    ) -> File {
        let file = tempfile::tempfile().unwrap();
        let fd = Arc::new(file.try_clone().unwrap());
        let flags = flags | Flags::KIND_TABLES | Flags::GZIP;
        let ctx = EncdecCtx::new(Arc::clone(&fd), flags);
        let mut appender = ctx.appender(HEADER_STORAGE_LEN);

        let mut encoded_blocks = Vec::new();
        let mut first = i64::MAX;
        let mut last = i64::MIN;

        for (timestamps, columns) in blocks {
            let mut dict = DictionaryDelta::new();

            // Group columns by group name.
            let mut groups: BTreeMap<&str, Vec<(&str, &Vec<Option<MetricValue>>)>> =
                BTreeMap::new();
            for &(group, metric, ref column) in columns {
                groups.entry(group).or_default().push((metric, column));
            }

            let mut table_entries = Vec::new();
            for (group, metrics) in groups {
                let mut metric_entries = Vec::new();
                for (metric, column) in metrics {
                    let metric_ref = dict
                        .encode_path(&[metric.to_string()])
                        .unwrap();
                    let mut payload = Vec::new();
                    MetricTableData::from_values(column.clone())
                        .encode(&mut payload, dict.strings_mut())
                        .unwrap();
                    let ptr = appender.put_segment(&payload, false).unwrap();
                    metric_entries.push((metric_ref, ptr));
                }
                metric_entries.sort_by_key(|&(r, _)| r);

                let group_table = GroupTable {
                    presence: Bitset::from_bits(vec![true; timestamps.len()]),
                    metrics: metric_entries,
                };
                let mut payload = Vec::new();
                group_table.encode(&mut payload).unwrap();
                let gt_ptr = appender.put_segment(&payload, false).unwrap();

                let grp_ref = dict.encode_path(&[group.to_string()]).unwrap();
                let tag_ref = dict.encode_tags(&Tags::new()).unwrap();
                table_entries.push(((grp_ref, tag_ref), gt_ptr));
            }

            table_entries.sort_by_key(|&(key, _)| key);
            let tables = Tables {
                groups: table_entries,
            };
            let mut payload = Vec::new();
            tables.encode(&mut payload).unwrap();
            let tables_ptr = appender.put_segment(&payload, false).unwrap();

            let mut payload = Vec::new();
            dict.encode_update(&mut payload).unwrap();
            let dict_ptr = appender.put_segment(&payload, false).unwrap();

            for &t in timestamps {
                first = first.min(t);
                last = last.max(t);
            }
            encoded_blocks.push(TablesBlock {
                timestamps: timestamps
                    .iter()
                    .map(|&t| TimePoint::from_millis(t))
                    .collect(),
                dict: dict_ptr,
                tables: tables_ptr,
            });
        }

        let mut payload = Vec::new();
        encode_file_data_tables(&mut payload, &encoded_blocks).unwrap();
        let fdt = appender.put_segment(&payload, false).unwrap();

        let hdr = TsfileHeader {
            first: TimePoint::from_millis(first),
            last: TimePoint::from_millis(last),
            flags,
            reserved: 0,
            file_size: appender.position(),
            fdt,
        };
        write_header(&fd, &MimeHeader::current(), &hdr).unwrap();
        file
    }

    #[test]
    fn read_all_materializes_columns() {
        let file = build_tables_file(
            Flags::SORTED | Flags::DISTINCT,
            &[(
                vec![10, 20, 30],
                vec![(
                    "grp",
                    "m",
                    vec![
                        Some(MetricValue::Int(1)),
                        None,
                        Some(MetricValue::Int(3)),
                    ],
                )],
            )],
        );

        let data = Tsdata::open(file).unwrap();
        let all = data.read_all().unwrap();
        assert_eq!(all.len(), 3);

        let group = GroupName::new(SimpleGroup::new(["grp"]), Tags::new());
        let metric = MetricName::new(["m"]);
        assert_eq!(all[0].data()[&group][&metric], MetricValue::Int(1));
        assert!(all[1].data()[&group].is_empty());
        assert_eq!(all[2].data()[&group][&metric], MetricValue::Int(3));
    }

    #[test]
    fn emit_filters_groups_and_metrics() {
        let file = build_tables_file(
            Flags::SORTED | Flags::DISTINCT,
            &[(
                vec![10, 20],
                vec![
                    ("keep", "m", vec![Some(MetricValue::Int(1)), Some(MetricValue::Int(2))]),
                    ("drop", "m", vec![Some(MetricValue::Int(9)), None]),
                ],
            )],
        );

        let Tsdata::Tables(data) = Tsdata::open(file).unwrap() else {
            panic!("expected a tables file");
        };
        let out = data
            .emit(
                None,
                None,
                |group, _| group.segments() == ["keep"],
                |_| true,
            )
            .unwrap();

        assert_eq!(out.len(), 2);
        let group = GroupName::new(SimpleGroup::new(["keep"]), Tags::new());
        let metric = MetricName::new(["m"]);
        assert_eq!(out[0].0, TimePoint::from_millis(10));
        assert_eq!(out[0].1[&(group.clone(), metric.clone())], MetricValue::Int(1));
        assert_eq!(out[1].1[&(group, metric)], MetricValue::Int(2));
    }

    #[test]
    fn emit_respects_time_range() {
        let file = build_tables_file(
            Flags::SORTED | Flags::DISTINCT,
            &[(
                vec![10, 20, 30],
                vec![(
                    "g",
                    "m",
                    vec![
                        Some(MetricValue::Int(1)),
                        Some(MetricValue::Int(2)),
                        Some(MetricValue::Int(3)),
                    ],
                )],
            )],
        );

        let Tsdata::Tables(data) = Tsdata::open(file).unwrap() else {
            panic!("expected a tables file");
        };
        let out = data
            .emit(
                Some(TimePoint::from_millis(15)),
                Some(TimePoint::from_millis(25)),
                |_, _| true,
                |_| true,
            )
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, TimePoint::from_millis(20));
    }

    #[test]
    fn unsorted_blocks_merge_on_emit() {
        // Two blocks with interleaved, duplicated timestamps and no
        // SORTED/DISTINCT flags.
        let file = build_tables_file(
            Flags::empty(),
            &[
                (vec![20, 10], vec![("g", "m", vec![Some(MetricValue::Int(20)), Some(MetricValue::Int(10))])]),
                (vec![15, 10], vec![("g", "n", vec![Some(MetricValue::Int(15)), Some(MetricValue::Int(11))])]),
            ],
        );

        let Tsdata::Tables(data) = Tsdata::open(file).unwrap() else {
            panic!("expected a tables file");
        };
        let out = data.emit(None, None, |_, _| true, |_| true).unwrap();

        let times: Vec<i64> = out.iter().map(|(t, _)| t.millis_since_epoch()).collect();
        assert_eq!(times, vec![10, 15, 20]);
        // Timestamp 10 combined values from both blocks.
        assert_eq!(out[0].1.len(), 2);

        assert_eq!(data.emit_time(None, None).unwrap().len(), 3);

        // read_all on the same file sorts and merges too.
        let all = data.read_all_raw();
        assert!(all.is_ok());
    }

    #[test]
    fn push_back_is_rejected() {
        let file = build_tables_file(Flags::SORTED | Flags::DISTINCT, &[(vec![1], vec![])]);
        let mut data = Tsdata::open(file).unwrap();
        let mut ts = TimeSeries::new(TimePoint::from_millis(5));
        ts.insert(
            GroupName::new(SimpleGroup::new(["g"]), Tags::new()),
            MetricMap::new(),
        );
        assert!(matches!(
            data.push_back(&ts),
            Err(crate::Error::Unsupported(_))
        ));
    }
}
