//! Run-length encoded bit vectors, used for presence columns.
//!
//! The wire form is a collection of `u16` run lengths of alternating
//! bit values, starting with `true`. Runs longer than `0x7fff` are
//! split with a zero-length run in between to keep the alternation.

use crate::xdr::{XdrRead, XdrWrite};
use crate::Result;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Bitset {
    bits: Vec<bool>,
}

impl Bitset {
    pub fn new() -> Self {
        Bitset::default()
    }

    pub fn from_bits(bits: Vec<bool>) -> Self {
        Bitset { bits }
    }

    pub fn push(&mut self, bit: bool) {
        self.bits.push(bit);
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<bool> {
        self.bits.get(idx).copied()
    }

    /// Set bit `idx`, growing the set with zeros as needed.
    pub fn set(&mut self, idx: usize, value: bool) {
        if self.bits.len() <= idx {
            self.bits.resize(idx + 1, false);
        }
        self.bits[idx] = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        self.bits.iter().copied()
    }

    /// Indexes of the set bits, ascending.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter_map(|(i, &b)| b.then_some(i))
    }

    pub fn count_ones(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    pub fn decode(reader: &mut impl XdrRead) -> Result<Self> {
        let mut bits = Vec::new();
        let mut current = true;
        reader.accept_collection(
            |r| r.get_u16(),
            |count| {
                bits.extend(std::iter::repeat(current).take(count as usize));
                current = !current;
            },
        )?;
        Ok(Bitset { bits })
    }

    pub fn encode(&self, writer: &mut impl XdrWrite) -> Result<()> {
        let mut counters: Vec<u16> = Vec::new();

        let mut current = true;
        let mut at = 0;
        while at < self.bits.len() {
            let run_end = self.bits[at..]
                .iter()
                .position(|&b| b != current)
                .map_or(self.bits.len(), |i| at + i);
            let mut count = run_end - at;

            while count > 0x7fff {
                counters.push(0x7fff);
                counters.push(0);
                count -= 0x7fff;
            }
            counters.push(count as u16);

            current = !current;
            at = run_end;
        }

        writer.put_collection(counters.into_iter(), |w, c| w.put_u16(c))
    }
}

impl FromIterator<bool> for Bitset {
    fn from_iter<I: IntoIterator<Item = bool>>(iter: I) -> Self {
        Bitset {
            bits: iter.into_iter().collect(),
        }
    }
}
