//! Switch range construction.
//!
//! A switch range is a maximal contiguous run of keys mapping to the same successor. Ranges
//! keep the compare chain short: a two-key range costs two equality branches, a longer range
//! costs one lower-bound skip and one upper-bound branch.

use crate::hir::BlockId;

/// A maximal contiguous key run with a single successor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SwitchRange {
    pub low_key: i32,
    pub high_key: i32,
    pub successor: BlockId,
}

impl SwitchRange {
    /// Number of keys the range covers.
    #[must_use]
    pub fn key_count(&self) -> i64 {
        i64::from(self.high_key) - i64::from(self.low_key) + 1
    }
}

/// Partition sorted `keys` and their parallel `successors` into switch ranges.
///
/// Adjacent keys with the same successor coalesce; the default successor is not part of any
/// range. Keys must be sorted ascending, which the class file format guarantees for lookup
/// switches and the dense indexing gives table switches.
#[must_use]
pub fn create_ranges(keys: &[i32], successors: &[BlockId]) -> Vec<SwitchRange> {
    debug_assert_eq!(keys.len(), successors.len());
    debug_assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
    let mut ranges: Vec<SwitchRange> = Vec::new();
    for (key, successor) in keys.iter().zip(successors.iter()) {
        match ranges.last_mut() {
            Some(range)
                if range.successor == *successor
                    && i64::from(*key) == i64::from(range.high_key) + 1 =>
            {
                range.high_key = *key;
            }
            _ => ranges.push(SwitchRange {
                low_key: *key,
                high_key: *key,
                successor: *successor,
            }),
        }
    }
    ranges
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_contiguous_keys_coalesce() {
        // case 0, 1 -> A; case 5 -> B
        let a = BlockId(1);
        let b = BlockId(2);
        let ranges = create_ranges(&[0, 1, 5], &[a, a, b]);
        assert_eq!(
            vec![
                SwitchRange {
                    low_key: 0,
                    high_key: 1,
                    successor: a
                },
                SwitchRange {
                    low_key: 5,
                    high_key: 5,
                    successor: b
                },
            ],
            ranges
        );
    }

    #[test]
    fn test_gap_breaks_range() {
        let a = BlockId(1);
        let ranges = create_ranges(&[0, 2], &[a, a]);
        assert_eq!(2, ranges.len());
        assert_eq!(0, ranges[0].low_key);
        assert_eq!(2, ranges[1].low_key);
    }

    #[test]
    fn test_successor_change_breaks_range() {
        let a = BlockId(1);
        let b = BlockId(2);
        let ranges = create_ranges(&[0, 1, 2], &[a, b, b]);
        assert_eq!(2, ranges.len());
        assert_eq!(
            SwitchRange {
                low_key: 1,
                high_key: 2,
                successor: b
            },
            ranges[1]
        );
    }

    #[test]
    fn test_ranges_partition_the_key_set() {
        let a = BlockId(1);
        let b = BlockId(2);
        let keys = [-3, -2, -1, 4, 5, 9];
        let successors = [a, a, b, b, b, a];
        let ranges = create_ranges(&keys, &successors);
        // Every key is covered by exactly one range
        for key in keys {
            let covering = ranges
                .iter()
                .filter(|range| range.low_key <= key && key <= range.high_key)
                .count();
            assert_eq!(1, covering, "key {key}");
        }
        // No range covers a key outside the set
        let total: i64 = ranges.iter().map(SwitchRange::key_count).sum();
        assert_eq!(i64::try_from(keys.len()).expect("count"), total);
    }

    #[test]
    fn test_empty() {
        assert!(create_ranges(&[], &[]).is_empty());
    }
}
