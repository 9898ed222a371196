use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::Histogram;

/// A single measured value.
///
/// Metric values appear both as measurements and as tag values, so the
/// type carries total equality, ordering and hashing; floats compare by
/// bit pattern through [`f64::total_cmp`] so that `NaN` does not poison
/// map keys.
#[derive(Clone, Debug, Default)]
pub enum MetricValue {
    /// The absence of a value. Distinct from not measuring at all: an
    /// empty value records that the metric existed.
    #[default]
    Empty,
    Bool(bool),
    Int(i64),
    Flt(f64),
    Str(Arc<str>),
    Histogram(Histogram),
}

impl MetricValue {
    pub fn from_string(s: impl Into<Arc<str>>) -> Self {
        MetricValue::Str(s.into())
    }

    /// Discriminant rank used by the total order.
    fn rank(&self) -> u8 {
        match self {
            MetricValue::Empty => 0,
            MetricValue::Bool(_) => 1,
            MetricValue::Int(_) => 2,
            MetricValue::Flt(_) => 3,
            MetricValue::Str(_) => 4,
            MetricValue::Histogram(_) => 5,
        }
    }
}

impl PartialEq for MetricValue {
    fn eq(&self, other: &Self) -> bool {
        use MetricValue::*;
        match (self, other) {
            (Empty, Empty) => true,
            (Bool(x), Bool(y)) => x == y,
            (Int(x), Int(y)) => x == y,
            (Flt(x), Flt(y)) => x.to_bits() == y.to_bits(),
            (Str(x), Str(y)) => x == y,
            (Histogram(x), Histogram(y)) => x == y,
            _ => false,
        }
    }
}

impl Eq for MetricValue {}

impl Hash for MetricValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            MetricValue::Empty => {}
            MetricValue::Bool(x) => x.hash(state),
            MetricValue::Int(x) => x.hash(state),
            MetricValue::Flt(x) => x.to_bits().hash(state),
            MetricValue::Str(x) => x.hash(state),
            MetricValue::Histogram(x) => x.hash(state),
        }
    }
}

impl PartialOrd for MetricValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MetricValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use MetricValue::*;
        match (self, other) {
            (Bool(x), Bool(y)) => x.cmp(y),
            (Int(x), Int(y)) => x.cmp(y),
            (Flt(x), Flt(y)) => x.total_cmp(y),
            (Str(x), Str(y)) => x.cmp(y),
            (Histogram(x), Histogram(y)) => x.cmp(y),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Bool(v)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Flt(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Str(v.into())
    }
}

impl From<Histogram> for MetricValue {
    fn from(v: Histogram) -> Self {
        MetricValue::Histogram(v)
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Empty => write!(f, "(none)"),
            MetricValue::Bool(x) => write!(f, "{x}"),
            MetricValue::Int(x) => write!(f, "{x}"),
            MetricValue::Flt(x) => write!(f, "{x}"),
            MetricValue::Str(x) => write!(f, "{x:?}"),
            MetricValue::Histogram(x) => write!(f, "{x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &MetricValue) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn nan_is_self_equal() {
        let x = MetricValue::Flt(f64::NAN);
        assert_eq!(x, x.clone());
        assert_eq!(x.cmp(&x.clone()), Ordering::Equal);
        assert_eq!(hash_of(&x), hash_of(&x.clone()));
    }

    #[test]
    fn kinds_are_ordered_by_rank() {
        let ordered = [
            MetricValue::Empty,
            MetricValue::Bool(true),
            MetricValue::Int(-1),
            MetricValue::Flt(0.0),
            MetricValue::from("a"),
            MetricValue::Histogram(Histogram::new()),
        ];
        for w in ordered.windows(2) {
            assert!(w[0] < w[1], "{} < {}", w[0], w[1]);
        }
    }

    #[test]
    fn int_and_float_are_distinct_values() {
        assert_ne!(MetricValue::Int(1), MetricValue::Flt(1.0));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_value() -> impl Strategy<Value = MetricValue> {
            prop_oneof![
                Just(MetricValue::Empty),
                any::<bool>().prop_map(MetricValue::Bool),
                any::<i64>().prop_map(MetricValue::Int),
                any::<f64>().prop_map(MetricValue::Flt),
                ".{0,12}".prop_map(MetricValue::from_string),
            ]
        }

        proptest! {
            #[test]
            fn order_is_total_and_consistent(a in arb_value(), b in arb_value()) {
                let ord = a.cmp(&b);
                prop_assert_eq!(b.cmp(&a), ord.reverse());
                prop_assert_eq!(a == b, ord == Ordering::Equal);
            }

            #[test]
            fn equal_values_hash_equal(a in arb_value()) {
                let b = a.clone();
                prop_assert_eq!(hash_of(&a), hash_of(&b));
            }
        }
    }
}
