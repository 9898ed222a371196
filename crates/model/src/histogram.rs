use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A histogram: counts bucketed over half-open `f64` ranges.
///
/// Ranges are kept sorted and non-overlapping; adding a range that
/// exactly matches an existing one accumulates into its count.
/// Counts are fractional because histograms are scaled during
/// downsampling.
#[derive(Clone, Debug, Default)]
pub struct Histogram {
    // Sorted by (lo, hi).
    buckets: Vec<(f64, f64, f64)>,
}

impl Histogram {
    pub fn new() -> Self {
        Histogram::default()
    }

    /// Add `count` to the bucket `[lo, hi)`.
    pub fn add(&mut self, lo: f64, hi: f64, count: f64) {
        let key = (lo, hi);
        let pos = self
            .buckets
            .binary_search_by(|&(blo, bhi, _)| cmp_range((blo, bhi), key));
        match pos {
            Ok(i) => self.buckets[i].2 += count,
            Err(i) => self.buckets.insert(i, (lo, hi, count)),
        }
    }

    /// Buckets in ascending range order, as `(lo, hi, count)` triples.
    pub fn buckets(&self) -> &[(f64, f64, f64)] {
        &self.buckets
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

fn cmp_range(x: (f64, f64), y: (f64, f64)) -> Ordering {
    x.0.total_cmp(&y.0).then_with(|| x.1.total_cmp(&y.1))
}

impl PartialEq for Histogram {
    fn eq(&self, other: &Self) -> bool {
        self.buckets.len() == other.buckets.len()
            && self
                .buckets
                .iter()
                .zip(&other.buckets)
                .all(|(x, y)| x.0.to_bits() == y.0.to_bits() && x.1.to_bits() == y.1.to_bits() && x.2.to_bits() == y.2.to_bits())
    }
}

impl Eq for Histogram {}

impl Hash for Histogram {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.buckets.len().hash(state);
        for &(lo, hi, count) in &self.buckets {
            lo.to_bits().hash(state);
            hi.to_bits().hash(state);
            count.to_bits().hash(state);
        }
    }
}

impl PartialOrd for Histogram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Histogram {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_bits = |x: &(f64, f64, f64), y: &(f64, f64, f64)| {
            x.0.total_cmp(&y.0)
                .then_with(|| x.1.total_cmp(&y.1))
                .then_with(|| x.2.total_cmp(&y.2))
        };
        let mut xs = self.buckets.iter();
        let mut ys = other.buckets.iter();
        loop {
            match (xs.next(), ys.next()) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(x), Some(y)) => match by_bits(x, y) {
                    Ordering::Equal => continue,
                    other => return other,
                },
            }
        }
    }
}

impl fmt::Display for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (lo, hi, count)) in self.buckets.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{lo}..{hi}={count}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_keeps_buckets_sorted() {
        let mut h = Histogram::new();
        h.add(10.0, 20.0, 1.0);
        h.add(0.0, 10.0, 2.0);
        h.add(20.0, 30.0, 3.0);
        assert_eq!(
            h.buckets(),
            &[(0.0, 10.0, 2.0), (10.0, 20.0, 1.0), (20.0, 30.0, 3.0)]
        );
    }

    #[test]
    fn add_accumulates_equal_range() {
        let mut h = Histogram::new();
        h.add(0.0, 1.0, 1.5);
        h.add(0.0, 1.0, 2.5);
        assert_eq!(h.buckets(), &[(0.0, 1.0, 4.0)]);
    }
}
