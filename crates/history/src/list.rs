//! The list kind: an append log of time series.
//!
//! Records are written newest-first; each points at its predecessor,
//! so reading the file walks the chain backwards over a stack to emit
//! oldest-first. Appending never touches existing data: the record and
//! its payload segments go past the current end, and only then is the
//! header rewritten to adopt them.

use std::fs::File;
use std::sync::Arc;

use log::debug;

use monsoon_model::{TimePoint, TimeSeries};

use crate::cache::{next_parent_id, CacheKey, CacheOptions, CacheTag, CachedValue, DecodeCache, ParentId};
use crate::ctx::EncdecCtx;
use crate::dictionary::DictionaryDelta;
use crate::record::{
    decode_record_array, decode_record_metrics, encode_record_array, encode_record_metrics,
    ListRecord,
};
use crate::segment::FileSegmentPtr;
use crate::tsfile::{write_header, Flags, MimeHeader, TsfileHeader};
use crate::Result;

pub struct TsdataList {
    fd: Arc<File>,
    mime: MimeHeader,
    hdr: TsfileHeader,
    ctx: EncdecCtx,
    cache: Arc<DecodeCache>,
    parent_id: ParentId,
}

impl TsdataList {
    pub(crate) fn new(fd: Arc<File>, mime: MimeHeader, hdr: TsfileHeader) -> Self {
        let ctx = EncdecCtx::new(Arc::clone(&fd), hdr.flags);
        TsdataList {
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

    fn decode_record(&self, ptr: FileSegmentPtr) -> Result<Arc<ListRecord>> {
        let key = CacheKey {
            parent: self.parent_id,
            ptr,
            tag: CacheTag::ListRecord,
        };
        let value = self.cache.get_or_decode(key, || {
            // Record framing is never compressed; only payloads are.
            let mut reader = self.ctx.new_reader(ptr, false)?;
            let record = ListRecord::decode(&mut reader)?;
            reader.finish()?;
            Ok((CachedValue::ListRecord(Arc::new(record)), 64))
        })?;
        match value {
            CachedValue::ListRecord(record) => Ok(record),
            _ => unreachable!("cache key carries the list-record tag"),
        }
    }

    /// The record chain, oldest first.
    fn record_chain(&self) -> Result<Vec<Arc<ListRecord>>> {
        let mut stack = Vec::new();
        if self.hdr.fdt.is_null() {
            return Ok(stack);
        }

        let mut cursor = Some(self.hdr.fdt);
        while let Some(ptr) = cursor {
            let record = self.decode_record(ptr)?;
            cursor = record.pred;
            stack.push(record);
        }
        stack.reverse();
        Ok(stack)
    }

    /// The dictionary: every delta in the chain, applied oldest first.
    fn dictionary(&self, chain: &[Arc<ListRecord>]) -> Result<DictionaryDelta> {
        let mut dict = DictionaryDelta::new();
        for record in chain {
            if let Some(dd) = record.dict_delta {
                let mut reader = self.ctx.new_reader(dd, true)?;
                dict.decode_update(&mut reader)?;
                reader.finish()?;
            }
        }
        Ok(dict)
    }

    pub(crate) fn read_all_raw(&self) -> Result<Vec<TimeSeries>> {
        let chain = self.record_chain()?;
        let dict = self.dictionary(&chain)?;

        let mut out = Vec::with_capacity(chain.len());
        for record in &chain {
            let mut reader = self.ctx.new_reader(record.records, true)?;
            let groups = decode_record_array(&mut reader, &dict)?;
            reader.finish()?;

            let mut ts = TimeSeries::new(record.ts);
            for (name, metrics_ptr) in groups {
                let key = CacheKey {
                    parent: self.parent_id,
                    ptr: metrics_ptr,
                    tag: CacheTag::RecordMetrics,
                };
                let value = self.cache.get_or_decode(key, || {
                    let mut reader = self.ctx.new_reader(metrics_ptr, true)?;
                    let metrics = decode_record_metrics(&mut reader, &dict)?;
                    reader.finish()?;
                    let weight = 64 * (1 + metrics.len());
                    Ok((CachedValue::RecordMetrics(Arc::new(metrics)), weight))
                })?;
                let CachedValue::RecordMetrics(metrics) = value else {
                    unreachable!("cache key carries the record-metrics tag");
                };
                ts.insert(name, (*metrics).clone());
            }
            out.push(ts);
        }
        Ok(out)
    }

    /// Append one time series and adopt it in the header.
    ///
    /// Any failure before the header rewrite leaves the file logically
    /// untouched; the physical tail is truncated back.
    pub(crate) fn push_back(&mut self, ts: &TimeSeries) -> Result<()> {
        let old_size = self.hdr.file_size;

        let result = self.push_back_inner(ts);
        if result.is_err() {
            // Drop the partial tail; the header never adopted it.
            if let Err(trunc_err) = self.fd.set_len(old_size) {
                debug!("failed to truncate after aborted append: {trunc_err}");
            }
        }
        result
    }

    fn push_back_inner(&mut self, ts: &TimeSeries) -> Result<()> {
        let chain = self.record_chain()?;
        let mut dict = self.dictionary(&chain)?;
        debug_assert!(!dict.update_pending());

        let mut appender = self.ctx.appender(self.hdr.file_size);

        // Metrics segments first, then the record array referencing
        // them.
        let mut groups = Vec::with_capacity(ts.data().len());
        for (name, metrics) in ts.data() {
            let mut payload = Vec::new();
            encode_record_metrics(&mut payload, metrics, &mut dict)?;
            groups.push((name.clone(), appender.put_segment(&payload, false)?));
        }

        let mut payload = Vec::new();
        encode_record_array(&mut payload, &groups, &mut dict)?;
        let records_ptr = appender.put_segment(&payload, false)?;

        // The dictionary delta, if this series introduced new names.
        let dict_delta = if dict.update_pending() {
            let mut payload = Vec::new();
            dict.encode_update(&mut payload)?;
            Some(appender.put_segment(&payload, false)?)
        } else {
            None
        };

        let record = ListRecord {
            ts: ts.time(),
            pred: (!self.hdr.fdt.is_null()).then_some(self.hdr.fdt),
            dict_delta,
            records: records_ptr,
            reserved: 0,
        };
        let mut payload = Vec::new();
        record.encode(&mut payload)?;
        let record_ptr = appender.put_segment(&payload, true)?;

        // Everything is in place past the old end; adopting it in the
        // header is the commit point.
        let mut hdr = self.hdr;
        if ts.time() < hdr.last {
            hdr.flags -= Flags::SORTED;
        }
        if ts.time() <= hdr.last {
            hdr.flags -= Flags::DISTINCT;
        }
        hdr.first = hdr.first.min(ts.time());
        hdr.last = hdr.last.max(ts.time());
        hdr.file_size = appender.position();
        hdr.fdt = record_ptr;

        write_header(&self.fd, &self.mime, &hdr)?;
        self.hdr = hdr;
        debug!(
            "appended series at {} ({} groups, file now {} bytes)",
            ts.time(),
            ts.data().len(),
            hdr.file_size,
        );
        Ok(())
    }

    /// First and last timestamp actually present, for diagnostics.
    pub fn time(&self) -> (TimePoint, TimePoint) {
        (self.hdr.first, self.hdr.last)
    }

    pub fn is_writable(&self) -> bool {
        true
    }

    /// Drop cached decodes addressing `offset`, e.g. after an external
    /// rewrite of that extent.
    pub fn invalidate(&self, offset: u64) {
        self.cache.invalidate(self.parent_id, offset);
    }
}
