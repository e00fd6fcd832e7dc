//! Ordered set of spindles awaiting repair on one side.

use log::warn;
use std::collections::VecDeque;

use crate::params::SortOrder;

/// Spindles needing repair on a side, in visiting order.
///
/// The set only ever shrinks from the front.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakPointSet {
    side_number: u32,
    spindles: VecDeque<u32>,
}

impl BreakPointSet {
    /// Build the set from raw break values.
    ///
    /// Zero means no break and is dropped. Negative values are not spindles and are dropped with a
    /// warning. Duplicates are visited once.
    pub fn new(side_number: u32, values: &[i32], order: SortOrder) -> Self {
        let mut spindles: Vec<u32> = values
            .iter()
            .filter_map(|v| match *v {
                0 => None,
                v if v < 0 => {
                    warn!("Ignoring break value {} on side {}", v, side_number);
                    None
                }
                v => Some(v as u32),
            })
            .collect();

        match order {
            SortOrder::Asc => spindles.sort_unstable(),
            SortOrder::Desc => spindles.sort_unstable_by(|a, b| b.cmp(a)),
        }
        spindles.dedup();

        Self {
            side_number,
            spindles: spindles.into(),
        }
    }

    pub fn side_number(&self) -> u32 {
        self.side_number
    }

    /// Remove and return the next spindle to visit.
    pub fn pop_first(&mut self) -> Option<u32> {
        self.spindles.pop_front()
    }

    pub fn len(&self) -> usize {
        self.spindles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spindles.is_empty()
    }

    /// Remaining spindles in visiting order.
    pub fn spindles(&self) -> Vec<u32> {
        self.spindles.iter().copied().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::params::WorkflowParams;

    #[test]
    fn test_parity_ordering() {
        let wf = WorkflowParams::default();

        let odd = BreakPointSet::new(3, &[5, 1, 3], wf.sort_for_side(3));
        assert_eq!(odd.spindles(), vec![1, 3, 5]);

        let even = BreakPointSet::new(4, &[5, 1, 3], wf.sort_for_side(4));
        assert_eq!(even.spindles(), vec![5, 3, 1]);
    }

    #[test]
    fn test_filtering() {
        let set = BreakPointSet::new(1, &[0, 4, -2, 4, 0, 9], SortOrder::Asc);
        assert_eq!(set.spindles(), vec![4, 9]);
        assert_eq!(set.side_number(), 1);

        assert!(BreakPointSet::new(1, &[0, 0], SortOrder::Desc).is_empty());
    }

    #[test]
    fn test_pop_first() {
        let mut set = BreakPointSet::new(2, &[2, 8, 6], SortOrder::Desc);

        assert_eq!(set.pop_first(), Some(8));
        assert_eq!(set.len(), 2);
        assert_eq!(set.pop_first(), Some(6));
        assert_eq!(set.pop_first(), Some(2));
        assert_eq!(set.pop_first(), None);
        assert!(set.is_empty());
    }
}
