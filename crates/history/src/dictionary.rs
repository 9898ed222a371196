//! The dictionary triple: strings, paths and tag sets.
//!
//! Every name in a v2 file is a `u32` reference into one of three
//! append-only tables. Paths reference the string table segment-wise;
//! tag sets reference it for their keys. Updates travel as *deltas*:
//! the entries appended since the last snapshot, prefixed with the
//! index they start at — a reader applying deltas out of order trips
//! the contiguity check instead of silently misnumbering.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::Arc;

use monsoon_model::{MetricValue, Tags};

use crate::record::{decode_metric_value, encode_metric_value};
use crate::xdr::{XdrRead, XdrWrite};
use crate::{Error, Result};

fn check_size(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::EncodingRange("dictionary too large"))
}

/// The string table.
#[derive(Clone, Debug, Default)]
pub struct StrvalDictionary {
    values: Vec<Arc<str>>,
    inverse: HashMap<Arc<str>, u32>,
    update_start: u32,
}

impl StrvalDictionary {
    /// Reference for `s`, appending it if absent.
    pub fn encode(&mut self, s: &str) -> Result<u32> {
        if let Some(&idx) = self.inverse.get(s) {
            return Ok(idx);
        }
        let idx = check_size(self.values.len())?;
        let value: Arc<str> = s.into();
        self.values.push(Arc::clone(&value));
        self.inverse.insert(value, idx);
        Ok(idx)
    }

    pub fn decode(&self, idx: u32) -> Result<&Arc<str>> {
        self.values
            .get(idx as usize)
            .ok_or(Error::DictionaryLookup(idx))
    }

    pub fn len(&self) -> u32 {
        self.values.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn update_pending(&self) -> bool {
        (self.update_start as usize) < self.values.len()
    }

    pub fn encode_update(&mut self, writer: &mut impl XdrWrite) -> Result<()> {
        writer.put_u32(self.update_start)?;
        writer.put_collection(
            self.values[self.update_start as usize..].iter(),
            |w, v| w.put_string(v),
        )?;
        self.update_start = self.len();
        Ok(())
    }

    pub fn decode_update(&mut self, reader: &mut impl XdrRead) -> Result<()> {
        let offset = reader.get_u32()?;
        if offset as usize != self.values.len() {
            return Err(Error::BadDictionaryUpdate);
        }
        reader.accept_collection(
            |r| r.get_string(),
            |s| {
                let value: Arc<str> = s.into();
                self.inverse
                    .insert(Arc::clone(&value), self.values.len() as u32);
                self.values.push(value);
            },
        )?;
        check_size(self.values.len())?;
        self.update_start = self.len();
        Ok(())
    }
}

/// The path table: paths stored as sequences of string references.
#[derive(Clone, Debug, Default)]
pub struct PathDictionary {
    values: Vec<Vec<u32>>,
    inverse: HashMap<Vec<u32>, u32>,
    update_start: u32,
}

impl PathDictionary {
    /// Reference for the path with the given segments; may append to
    /// the string table.
    pub fn encode(&mut self, segments: &[String], strings: &mut StrvalDictionary) -> Result<u32> {
        let refs = segments
            .iter()
            .map(|s| strings.encode(s))
            .collect::<Result<Vec<u32>>>()?;
        if let Some(&idx) = self.inverse.get(&refs) {
            return Ok(idx);
        }
        let idx = check_size(self.values.len())?;
        self.values.push(refs.clone());
        self.inverse.insert(refs, idx);
        Ok(idx)
    }

    pub fn decode(&self, idx: u32, strings: &StrvalDictionary) -> Result<Vec<String>> {
        let refs = self
            .values
            .get(idx as usize)
            .ok_or(Error::DictionaryLookup(idx))?;
        refs.iter()
            .map(|&r| strings.decode(r).map(|s| s.to_string()))
            .collect()
    }

    pub fn update_pending(&self) -> bool {
        (self.update_start as usize) < self.values.len()
    }

    pub fn encode_update(&mut self, writer: &mut impl XdrWrite) -> Result<()> {
        writer.put_u32(self.update_start)?;
        writer.put_collection(
            self.values[self.update_start as usize..].iter(),
            |w, path| w.put_collection(path.iter(), |w, &seg| w.put_u32(seg)),
        )?;
        self.update_start = self.values.len() as u32;
        Ok(())
    }

    pub fn decode_update(&mut self, reader: &mut impl XdrRead) -> Result<()> {
        let offset = reader.get_u32()?;
        if offset as usize != self.values.len() {
            return Err(Error::BadDictionaryUpdate);
        }
        reader.accept_collection(
            |r| r.get_collection(|r| r.get_u32()),
            |path| {
                self.inverse.insert(path.clone(), self.values.len() as u32);
                self.values.push(path);
            },
        )?;
        check_size(self.values.len())?;
        self.update_start = self.values.len() as u32;
        Ok(())
    }
}

type TagData = BTreeMap<u32, MetricValue>;

/// The tag-set table: maps from string reference to metric value.
#[derive(Clone, Debug, Default)]
pub struct TagDictionary {
    values: Vec<TagData>,
    inverse: HashMap<TagData, u32>,
    update_start: u32,
}

impl TagDictionary {
    /// Reference for `tags`; may append to the string table (for tag
    /// names and string-valued tags alike).
    pub fn encode(&mut self, tags: &Tags, strings: &mut StrvalDictionary) -> Result<u32> {
        let mut data = TagData::new();
        for (name, value) in tags.iter() {
            data.insert(strings.encode(name)?, value.clone());
        }
        if let Some(&idx) = self.inverse.get(&data) {
            return Ok(idx);
        }
        let idx = check_size(self.values.len())?;
        self.values.push(data.clone());
        self.inverse.insert(data, idx);
        Ok(idx)
    }

    pub fn decode(&self, idx: u32, strings: &StrvalDictionary) -> Result<Tags> {
        let data = self
            .values
            .get(idx as usize)
            .ok_or(Error::DictionaryLookup(idx))?;
        let mut tags = Tags::new();
        for (&name_ref, value) in data {
            tags.insert(strings.decode(name_ref)?.to_string(), value.clone());
        }
        Ok(tags)
    }

    pub fn update_pending(&self) -> bool {
        (self.update_start as usize) < self.values.len()
    }

    /// Each entry is written in two passes: the key references, then
    /// the values, so readers can pair them back up positionally.
    pub fn encode_update(
        &mut self,
        writer: &mut impl XdrWrite,
        strings: &mut StrvalDictionary,
    ) -> Result<()> {
        writer.put_u32(self.update_start)?;
        let pending: Vec<TagData> = self.values[self.update_start as usize..].to_vec();
        writer.put_collection(pending.iter(), |w, entry| {
            w.put_collection(entry.keys(), |w, &k| w.put_u32(k))?;
            w.put_collection(entry.values(), |w, v| encode_metric_value(w, v, strings))
        })?;
        self.update_start = self.values.len() as u32;
        Ok(())
    }

    pub fn decode_update(
        &mut self,
        reader: &mut impl XdrRead,
        strings: &StrvalDictionary,
    ) -> Result<()> {
        let offset = reader.get_u32()?;
        if offset as usize != self.values.len() {
            return Err(Error::BadDictionaryUpdate);
        }

        let n = reader.get_u32()?;
        for _ in 0..n {
            let keys = reader.get_collection(|r| r.get_u32())?;
            let values = reader.get_collection(|r| decode_metric_value(r, strings))?;
            if keys.len() != values.len() {
                return Err(Error::EncodingRange("tag dictionary length mismatch"));
            }
            let data: TagData = keys.into_iter().zip(values).collect();
            self.inverse.insert(data.clone(), self.values.len() as u32);
            self.values.push(data);
        }
        check_size(self.values.len())?;
        self.update_start = self.values.len() as u32;
        Ok(())
    }
}

/// The three dictionaries of one file (or one tables block), with the
/// delta-update protocol over all of them.
#[derive(Clone, Debug, Default)]
pub struct DictionaryDelta {
    strings: StrvalDictionary,
    paths: PathDictionary,
    tags: TagDictionary,
}

impl DictionaryDelta {
    pub fn new() -> Self {
        DictionaryDelta::default()
    }

    pub fn strings(&self) -> &StrvalDictionary {
        &self.strings
    }

    pub fn strings_mut(&mut self) -> &mut StrvalDictionary {
        &mut self.strings
    }

    pub fn encode_path(&mut self, segments: &[String]) -> Result<u32> {
        self.paths.encode(segments, &mut self.strings)
    }

    pub fn decode_path(&self, idx: u32) -> Result<Vec<String>> {
        self.paths.decode(idx, &self.strings)
    }

    pub fn encode_tags(&mut self, tags: &Tags) -> Result<u32> {
        self.tags.encode(tags, &mut self.strings)
    }

    pub fn decode_tags(&self, idx: u32) -> Result<Tags> {
        self.tags.decode(idx, &self.strings)
    }

    pub fn update_pending(&self) -> bool {
        self.strings.update_pending() || self.paths.update_pending() || self.tags.update_pending()
    }

    /// Write the pending delta.
    ///
    /// Path and tag updates are serialized into a scratch buffer
    /// first: encoding them may append to the string table, and the
    /// wire keeps dependencies before dependents — string update
    /// first, then paths, then tags.
    pub fn encode_update(&mut self, writer: &mut impl XdrWrite) -> Result<()> {
        let mut scratch = Vec::new();
        self.paths.encode_update(&mut scratch)?;
        self.tags.encode_update(&mut scratch, &mut self.strings)?;

        self.strings.encode_update(writer)?;
        writer.write_all(&scratch)?;
        Ok(())
    }

    pub fn decode_update(&mut self, reader: &mut impl XdrRead) -> Result<()> {
        self.strings.decode_update(reader)?;
        self.paths.decode_update(reader)?;
        self.tags.decode_update(reader, &self.strings)
    }
}
