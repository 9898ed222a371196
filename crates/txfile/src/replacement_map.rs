use std::collections::BTreeMap;

/// An overlay of pending byte ranges on top of a raw file.
///
/// The map holds non-overlapping half-open intervals `[begin, end)` of
/// replacement bytes, keyed by begin offset. Transactions stage their
/// writes here, and the WAL region keeps the committed-but-not-yet-
/// compacted state of the data region in one of these.
///
/// Writes that abut or overlap existing intervals coalesce into a
/// single interval covering the whole range.
#[derive(Clone, Debug, Default)]
pub struct ReplacementMap {
    map: BTreeMap<u64, Vec<u8>>,
}

impl ReplacementMap {
    pub fn new() -> Self {
        ReplacementMap::default()
    }

    /// Stage a write of `data` at `off`.
    ///
    /// Nothing is visible until [`PendingWrite::commit`] is called;
    /// dropping the handle discards the write.
    pub fn write_at(&mut self, off: u64, data: impl Into<Vec<u8>>) -> PendingWrite<'_> {
        PendingWrite {
            map: self,
            off,
            data: data.into(),
        }
    }

    /// Immediately merge a write, without the pending-handle detour.
    pub fn put(&mut self, off: u64, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        let end = off + data.len() as u64;

        let mut new_begin = off;
        let mut new_data = data;

        // Absorb a predecessor that overlaps or exactly abuts.
        if let Some((&pbegin, pdata)) = self.map.range(..=off).next_back() {
            let pend = pbegin + pdata.len() as u64;
            if pend >= off {
                let pdata = self.map.remove(&pbegin).unwrap();
                let keep = (off - pbegin) as usize;
                let mut merged = Vec::with_capacity(keep + new_data.len());
                merged.extend_from_slice(&pdata[..keep]);
                merged.extend_from_slice(&new_data);
                // The predecessor may extend past the new write.
                if pend > end {
                    merged.extend_from_slice(&pdata[(end - pbegin) as usize..]);
                }
                new_begin = pbegin;
                new_data = merged;
            }
        }
        let mut new_end = new_begin + new_data.len() as u64;

        // Absorb every interval starting inside (or exactly at the end
        // of) the new range.
        while let Some((&sbegin, sdata)) = self.map.range(new_begin..=new_end).next() {
            let send = sbegin + sdata.len() as u64;
            let sdata = self.map.remove(&sbegin).unwrap();
            if send > new_end {
                new_data.extend_from_slice(&sdata[(new_end - sbegin) as usize..]);
                new_end = send;
            }
        }

        self.map.insert(new_begin, new_data);
    }

    /// Read the longest contiguous run starting at `off` into `buf`.
    ///
    /// Returns 0 if `off` is not covered by any interval. A nonzero
    /// return may be shorter than `buf`; the caller is expected to
    /// fall through to the next layer for the remainder.
    pub fn read_at(&self, off: u64, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let Some((&begin, data)) = self.map.range(..=off).next_back() else {
            return 0;
        };
        let end = begin + data.len() as u64;
        if off >= end {
            return 0;
        }
        let skip = (off - begin) as usize;
        let n = buf.len().min(data.len() - skip);
        buf[..n].copy_from_slice(&data[skip..skip + n]);
        n
    }

    /// Length of the gap starting at `off`: how many bytes a lower
    /// layer may serve before running into the next interval. `None`
    /// when no interval follows.
    ///
    /// Callers that fall through after a zero-byte [`read_at`] must
    /// clamp their read to this, or stale lower-layer bytes would mask
    /// the replacement data.
    pub fn gap_len(&self, off: u64) -> Option<u64> {
        self.map.range(off..).next().map(|(&begin, _)| begin - off)
    }

    /// Drop all data at or beyond `new_size`, clipping the interval
    /// that crosses it.
    pub fn truncate(&mut self, new_size: u64) {
        self.map.retain(|&begin, _| begin < new_size);
        if let Some((&begin, data)) = self.map.range(..new_size).next_back() {
            let end = begin + data.len() as u64;
            if end > new_size {
                let keep = (new_size - begin) as usize;
                self.map.get_mut(&begin).unwrap().truncate(keep);
                if keep == 0 {
                    self.map.remove(&begin);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Intervals in ascending offset order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[u8])> {
        self.map.iter().map(|(&off, data)| (off, data.as_slice()))
    }
}

/// A staged write into a [`ReplacementMap`].
///
/// Commit merges the staged range into the map; drop discards it.
#[must_use = "a pending write does nothing unless committed"]
pub struct PendingWrite<'a> {
    map: &'a mut ReplacementMap,
    off: u64,
    data: Vec<u8>,
}

impl PendingWrite<'_> {
    pub fn commit(self) {
        let PendingWrite { map, off, data } = self;
        map.put(off, data);
    }

    pub fn rollback(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn map_of(parts: &[(u64, &[u8])]) -> ReplacementMap {
        let mut m = ReplacementMap::new();
        for &(off, data) in parts {
            m.put(off, data.to_vec());
        }
        m
    }

    fn intervals(m: &ReplacementMap) -> Vec<(u64, Vec<u8>)> {
        m.iter().map(|(off, d)| (off, d.to_vec())).collect()
    }

    #[test]
    fn read_at_gap_returns_zero() {
        let m = map_of(&[(10, b"abc")]);
        let mut buf = [0u8; 4];
        assert_eq!(m.read_at(0, &mut buf), 0);
        assert_eq!(m.read_at(13, &mut buf), 0);
    }

    #[test]
    fn read_at_mid_interval() {
        let m = map_of(&[(10, b"abcdef")]);
        let mut buf = [0u8; 3];
        assert_eq!(m.read_at(12, &mut buf), 3);
        assert_eq!(&buf, b"cde");
    }

    #[test]
    fn abutting_writes_coalesce() {
        let m = map_of(&[(0, b"abc"), (3, b"def")]);
        assert_eq!(intervals(&m), vec![(0, b"abcdef".to_vec())]);
    }

    #[test]
    fn contained_write_overwrites_in_place() {
        let m = map_of(&[(0, b"abcdef"), (2, b"XY")]);
        assert_eq!(intervals(&m), vec![(0, b"abXYef".to_vec())]);
    }

    #[test]
    fn spanning_write_produces_single_interval() {
        // Write spanning a gap and two intervals.
        let m = map_of(&[(0, b"ab"), (6, b"gh"), (1, b"ZZZZZZ")]);
        assert_eq!(intervals(&m), vec![(0, b"aZZZZZZh".to_vec())]);
    }

    #[test]
    fn gap_len_bounds_lower_layers() {
        let m = map_of(&[(10, b"abc")]);
        assert_eq!(m.gap_len(4), Some(6));
        assert_eq!(m.gap_len(13), None);
        assert_eq!(m.gap_len(0), Some(10));
    }

    #[test]
    fn truncate_clips_crossing_interval() {
        let mut m = map_of(&[(0, b"abc"), (10, b"defg")]);
        m.truncate(12);
        assert_eq!(intervals(&m), vec![(0, b"abc".to_vec()), (10, b"de".to_vec())]);
        m.truncate(10);
        assert_eq!(intervals(&m), vec![(0, b"abc".to_vec())]);
        m.truncate(0);
        assert!(m.is_empty());
    }

    #[test]
    fn pending_write_rollback_leaves_map_unchanged() {
        let mut m = map_of(&[(0, b"abc")]);
        m.write_at(1, b"ZZ".to_vec()).rollback();
        assert_eq!(intervals(&m), vec![(0, b"abc".to_vec())]);
        m.write_at(1, b"ZZ".to_vec()).commit();
        assert_eq!(intervals(&m), vec![(0, b"aZZ".to_vec())]);
    }

    proptest! {
        // Writing random fragments must read back like a flat buffer.
        #[test]
        fn reads_agree_with_flat_model(
            writes in prop::collection::vec((0u64..200, prop::collection::vec(any::<u8>(), 1..32)), 1..32)
        ) {
            let mut model = vec![None::<u8>; 256];
            let mut m = ReplacementMap::new();
            for (off, data) in &writes {
                for (i, &b) in data.iter().enumerate() {
                    model[*off as usize + i] = Some(b);
                }
                m.put(*off, data.clone());
            }

            // Intervals are sorted, non-overlapping and non-abutting.
            let mut prev_end = None;
            for (off, data) in m.iter() {
                if let Some(pe) = prev_end {
                    prop_assert!(off > pe);
                }
                prev_end = Some(off + data.len() as u64);
            }

            // Every offset reads back the model value.
            for off in 0..model.len() {
                let mut b = [0u8; 1];
                let n = m.read_at(off as u64, &mut b);
                match model[off] {
                    Some(expect) => {
                        prop_assert_eq!(n, 1);
                        prop_assert_eq!(b[0], expect);
                    }
                    None => prop_assert_eq!(n, 0),
                }
            }
        }
    }
}
