use std::fmt::{Display, Formatter};

use super::BlockNumber;

/// A range of blocks. The range is inclusive of both the first and last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRange {
    pub start: BlockNumber,
    pub end: BlockNumber,
}

impl BlockRange {
    /// `None` when `first` lies past `last`, there is nothing to walk then.
    pub fn new(first: BlockNumber, last: BlockNumber) -> Option<Self> {
        if first > last {
            return None;
        }

        Some(Self {
            start: first,
            end: last,
        })
    }

    /// Walks from `start` up to the chain height, or the limit when that comes first.
    pub fn up_to_height(
        start: BlockNumber,
        height: BlockNumber,
        limit: Option<BlockNumber>,
    ) -> Option<Self> {
        let end = limit.map_or(height, |limit| limit.min(height));
        Self::new(start, end)
    }

    /// Saturates at `u64::MAX` for the one range, `0..=u64::MAX`, that holds one more block.
    pub fn count(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }
}

impl Display for BlockRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl IntoIterator for BlockRange {
    type Item = BlockNumber;
    type IntoIter = std::ops::RangeInclusive<BlockNumber>;

    fn into_iter(self) -> Self::IntoIter {
        self.start..=self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_range_iterable_test() {
        let range = BlockRange::new(1, 4)
            .unwrap()
            .into_iter()
            .collect::<Vec<BlockNumber>>();
        assert_eq!(range, vec![1, 2, 3, 4]);
    }

    #[test]
    fn block_range_single_block_test() {
        let range = BlockRange::new(7, 7).unwrap();
        assert_eq!(range.count(), 1);
        assert_eq!(range.into_iter().collect::<Vec<_>>(), vec![7]);
    }

    #[test]
    fn block_range_count_saturates_test() {
        assert_eq!(BlockRange::new(0, u64::MAX).unwrap().count(), u64::MAX);
        assert_eq!(BlockRange::new(1, u64::MAX).unwrap().count(), u64::MAX);
    }

    #[test]
    fn block_range_negative_test() {
        assert_eq!(BlockRange::new(5, 4), None);
    }

    #[test]
    fn block_range_up_to_height_test() {
        assert_eq!(
            BlockRange::up_to_height(0, 3, None),
            Some(BlockRange { start: 0, end: 3 })
        );
        assert_eq!(
            BlockRange::up_to_height(0, 850_870, Some(9)),
            Some(BlockRange { start: 0, end: 9 })
        );
        assert_eq!(
            BlockRange::up_to_height(0, 3, Some(100)),
            Some(BlockRange { start: 0, end: 3 })
        );
        assert_eq!(BlockRange::up_to_height(4, 3, None), None);
    }

    #[test]
    fn block_range_display_test() {
        assert_eq!(BlockRange::new(0, 9).unwrap().to_string(), "0-9");
    }
}
