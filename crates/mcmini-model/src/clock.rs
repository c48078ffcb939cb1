//! Logical clock vectors over thread ids.
//!
//! Only the pointwise partial order is defined; there is no total order.
//! Components default to zero for threads that never appear.

use crate::Tid;
use std::collections::BTreeMap;
use std::fmt;

/// A mapping from thread id to a u64 logical clock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClockVector {
    components: BTreeMap<Tid, u64>,
}

impl ClockVector {
    /// The all-zero vector.
    pub fn zero() -> Self {
        Self::default()
    }

    /// The component for `tid` (zero if unseen).
    pub fn get(&self, tid: Tid) -> u64 {
        self.components.get(&tid).copied().unwrap_or(0)
    }

    /// Set the component for `tid`.
    pub fn set(&mut self, tid: Tid, value: u64) {
        self.components.insert(tid, value);
    }

    /// Increment the component for `tid` by one.
    pub fn increment(&mut self, tid: Tid) {
        *self.components.entry(tid).or_insert(0) += 1;
    }

    /// Pointwise maximum with `other`, stored in place.
    pub fn join(&mut self, other: &ClockVector) {
        for (&tid, &value) in &other.components {
            let entry = self.components.entry(tid).or_insert(0);
            *entry = (*entry).max(value);
        }
    }

    /// Pointwise less-than-or-equal.
    pub fn le(&self, other: &ClockVector) -> bool {
        self.components
            .iter()
            .all(|(&tid, &value)| value <= other.get(tid))
    }
}

impl fmt::Display for ClockVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<")?;
        for (i, (tid, value)) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{tid}:{value}")?;
        }
        write!(f, ">")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_all_zero() {
        let cv = ClockVector::zero();
        assert_eq!(cv.get(0), 0);
        assert_eq!(cv.get(17), 0);
    }

    #[test]
    fn increment_and_get() {
        let mut cv = ClockVector::zero();
        cv.increment(2);
        cv.increment(2);
        cv.increment(0);
        assert_eq!(cv.get(2), 2);
        assert_eq!(cv.get(0), 1);
        assert_eq!(cv.get(1), 0);
    }

    #[test]
    fn join_is_pointwise_max() {
        let mut a = ClockVector::zero();
        a.set(0, 3);
        a.set(1, 1);
        let mut b = ClockVector::zero();
        b.set(1, 5);
        b.set(2, 2);

        a.join(&b);
        assert_eq!(a.get(0), 3);
        assert_eq!(a.get(1), 5);
        assert_eq!(a.get(2), 2);
    }

    #[test]
    fn join_is_upper_bound() {
        let mut a = ClockVector::zero();
        a.set(0, 3);
        let mut b = ClockVector::zero();
        b.set(1, 4);

        let mut joined = a.clone();
        joined.join(&b);
        assert!(a.le(&joined));
        assert!(b.le(&joined));
    }

    #[test]
    fn le_is_partial() {
        let mut a = ClockVector::zero();
        a.set(0, 1);
        let mut b = ClockVector::zero();
        b.set(1, 1);

        // Incomparable in both directions
        assert!(!a.le(&b));
        assert!(!b.le(&a));
        // Zero is below everything
        assert!(ClockVector::zero().le(&a));
    }
}
