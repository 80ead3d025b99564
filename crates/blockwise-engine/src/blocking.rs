//! Implementation of volume blocking.
//!
//! A [`Blocking`] deterministically partitions an N-dimensional volume (or a
//! region of interest within it) into an ordered sequence of axis-aligned
//! [`Block`]s of a fixed shape.
//!
//! Blocks are laid out on a grid anchored at the beginning of the region of
//! interest. The last block along an axis is clipped to the end of the region,
//! so it may be smaller than the block shape, but it is never empty.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Represents an error for a malformed shape, block shape, or region of
/// interest.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRegionError {
    /// The volume shape has no dimensions.
    #[error("volume shape must have at least one dimension")]
    EmptyShape,
    /// A shape has a different dimensionality than the volume.
    #[error("{what} has {actual} dimension(s), but the volume has {expected}")]
    DimensionMismatch {
        /// What was mismatched (e.g. `block shape`).
        what: &'static str,
        /// The expected number of dimensions.
        expected: usize,
        /// The actual number of dimensions.
        actual: usize,
    },
    /// A block shape entry is zero.
    #[error("block shape must be greater than zero along axis {axis}")]
    ZeroBlockShape {
        /// The offending axis.
        axis: usize,
    },
    /// The region of interest begins after it ends.
    #[error("region of interest begins at {begin} but ends at {end} along axis {axis}")]
    InvertedRegion {
        /// The offending axis.
        axis: usize,
        /// The beginning of the region along the axis.
        begin: u64,
        /// The end of the region along the axis.
        end: u64,
    },
    /// The region of interest extends past the volume.
    #[error("region of interest ends at {end} along axis {axis}, past the volume extent of {extent}")]
    RegionOutOfBounds {
        /// The offending axis.
        axis: usize,
        /// The end of the region along the axis.
        end: u64,
        /// The extent of the volume along the axis.
        extent: u64,
    },
    /// The number of blocks cannot be represented.
    #[error("the blocking has too many blocks to be numbered")]
    TooManyBlocks,
}

/// Represents a region of interest within a volume.
///
/// The region is half-open: `begin` is inclusive and `end` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    /// The inclusive beginning of the region, per axis.
    pub begin: Vec<u64>,
    /// The exclusive end of the region, per axis.
    pub end: Vec<u64>,
}

impl Roi {
    /// Constructs a new region of interest.
    pub fn new(begin: impl Into<Vec<u64>>, end: impl Into<Vec<u64>>) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
        }
    }
}

/// Represents a single block of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// The identifier of the block within its blocking.
    pub id: usize,
    /// The inclusive beginning of the block, per axis.
    pub begin: Vec<u64>,
    /// The exclusive end of the block, per axis.
    pub end: Vec<u64>,
}

impl Block {
    /// Gets the shape of the block.
    pub fn shape(&self) -> Vec<u64> {
        self.begin
            .iter()
            .zip(&self.end)
            .map(|(b, e)| e - b)
            .collect()
    }

    /// Gets the number of elements in the block.
    pub fn size(&self) -> u64 {
        self.shape().iter().product()
    }

    /// Determines if this block shares at least one element with another.
    pub fn overlaps(&self, other: &Block) -> bool {
        self.begin
            .iter()
            .zip(&self.end)
            .zip(other.begin.iter().zip(&other.end))
            .all(|((b1, e1), (b2, e2))| b1 < e2 && b2 < e1)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {id} [", id = self.id)?;
        for (i, (b, e)) in self.begin.iter().zip(&self.end).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{b}..{e}")?;
        }
        write!(f, "]")
    }
}

/// Represents a blocking of a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blocking {
    /// The shape of the volume.
    shape: Vec<u64>,
    /// The shape of a (non-clipped) block.
    block_shape: Vec<u64>,
    /// The region of interest being blocked.
    roi: Roi,
    /// The number of blocks along each axis.
    blocks_per_axis: Vec<u64>,
    /// The total number of blocks.
    num_blocks: usize,
}

impl Blocking {
    /// Constructs a new blocking of the given volume shape.
    ///
    /// If `roi` is `None`, the whole volume is blocked.
    pub fn new(
        shape: &[u64],
        block_shape: &[u64],
        roi: Option<Roi>,
    ) -> Result<Self, InvalidRegionError> {
        if shape.is_empty() {
            return Err(InvalidRegionError::EmptyShape);
        }

        check_rank("block shape", shape.len(), block_shape.len())?;
        if let Some(axis) = block_shape.iter().position(|s| *s == 0) {
            return Err(InvalidRegionError::ZeroBlockShape { axis });
        }

        let roi = match roi {
            Some(roi) => {
                check_rank("region of interest begin", shape.len(), roi.begin.len())?;
                check_rank("region of interest end", shape.len(), roi.end.len())?;
                for axis in 0..shape.len() {
                    if roi.begin[axis] > roi.end[axis] {
                        return Err(InvalidRegionError::InvertedRegion {
                            axis,
                            begin: roi.begin[axis],
                            end: roi.end[axis],
                        });
                    }

                    if roi.end[axis] > shape[axis] {
                        return Err(InvalidRegionError::RegionOutOfBounds {
                            axis,
                            end: roi.end[axis],
                            extent: shape[axis],
                        });
                    }
                }
                roi
            }
            None => Roi::new(vec![0; shape.len()], shape),
        };

        let blocks_per_axis: Vec<u64> = roi
            .begin
            .iter()
            .zip(&roi.end)
            .zip(block_shape)
            .map(|((b, e), s)| (e - b).div_ceil(*s))
            .collect();

        let num_blocks = blocks_per_axis
            .iter()
            .try_fold(1u64, |n, count| n.checked_mul(*count))
            .and_then(|n| usize::try_from(n).ok())
            .ok_or(InvalidRegionError::TooManyBlocks)?;

        Ok(Self {
            shape: shape.to_vec(),
            block_shape: block_shape.to_vec(),
            roi,
            blocks_per_axis,
            num_blocks,
        })
    }

    /// Gets the shape of the volume.
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// Gets the block shape.
    pub fn block_shape(&self) -> &[u64] {
        &self.block_shape
    }

    /// Gets the region of interest that was blocked.
    pub fn roi(&self) -> &Roi {
        &self.roi
    }

    /// Gets the number of blocks along each axis.
    pub fn blocks_per_axis(&self) -> &[u64] {
        &self.blocks_per_axis
    }

    /// Gets the total number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Gets the block with the given identifier.
    ///
    /// Returns `None` if the identifier is out of range.
    pub fn block(&self, id: usize) -> Option<Block> {
        if id >= self.num_blocks() {
            return None;
        }

        // Unflatten the id in row-major order (last axis varies fastest)
        let ndim = self.shape.len();
        let mut position = vec![0u64; ndim];
        let mut rest = id as u64;
        for axis in (0..ndim).rev() {
            position[axis] = rest % self.blocks_per_axis[axis];
            rest /= self.blocks_per_axis[axis];
        }

        let mut begin = Vec::with_capacity(ndim);
        let mut end = Vec::with_capacity(ndim);
        for axis in 0..ndim {
            // The block lies within the region, so neither sum can overflow
            let b = self.roi.begin[axis] + position[axis] * self.block_shape[axis];
            begin.push(b);
            end.push(b + self.block_shape[axis].min(self.roi.end[axis] - b));
        }

        Some(Block { id, begin, end })
    }

    /// Gets an iterator over all blocks in identifier order.
    pub fn blocks(&self) -> impl Iterator<Item = Block> + '_ {
        (0..self.num_blocks()).filter_map(|id| self.block(id))
    }

    /// Gets all block identifiers in order.
    pub fn block_ids(&self) -> Vec<usize> {
        (0..self.num_blocks()).collect()
    }
}

/// Checks that a shape has the expected number of dimensions.
fn check_rank(what: &'static str, expected: usize, actual: usize) -> Result<(), InvalidRegionError> {
    if expected != actual {
        return Err(InvalidRegionError::DimensionMismatch {
            what,
            expected,
            actual,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Asserts the blocks of a blocking are disjoint, non-empty, and exactly
    /// cover the region of interest.
    fn assert_exact_cover(blocking: &Blocking) {
        let blocks: Vec<_> = blocking.blocks().collect();
        let ids: Vec<_> = blocks.iter().map(|b| b.id).collect();
        assert_eq!(ids, (0..blocks.len()).collect::<Vec<_>>());

        for (i, a) in blocks.iter().enumerate() {
            assert!(a.size() > 0, "{a} is empty");
            for (axis, (b, e)) in a.begin.iter().zip(&a.end).enumerate() {
                assert!(*b >= blocking.roi().begin[axis]);
                assert!(*e <= blocking.roi().end[axis]);
            }
            for b in &blocks[i + 1..] {
                assert!(!a.overlaps(b), "{a} overlaps {b}");
            }
        }

        let roi_size: u64 = blocking
            .roi()
            .begin
            .iter()
            .zip(&blocking.roi().end)
            .map(|(b, e)| e - b)
            .product();
        assert_eq!(blocks.iter().map(Block::size).sum::<u64>(), roi_size);
    }

    #[test]
    fn whole_volume() {
        let blocking = Blocking::new(&[100, 100, 100], &[50, 50, 50], None).unwrap();
        assert_eq!(blocking.num_blocks(), 8);
        assert_eq!(
            blocking.block(1).unwrap(),
            Block {
                id: 1,
                begin: vec![0, 0, 50],
                end: vec![50, 50, 100],
            }
        );
        assert_eq!(
            blocking.block(6).unwrap(),
            Block {
                id: 6,
                begin: vec![50, 50, 0],
                end: vec![100, 100, 50],
            }
        );
        assert!(blocking.block(8).is_none());
        assert_exact_cover(&blocking);
    }

    #[test]
    fn clipped_blocks() {
        let blocking = Blocking::new(&[10, 7], &[4, 3], None).unwrap();
        assert_eq!(blocking.blocks_per_axis(), &[3, 3]);
        let last = blocking.block(8).unwrap();
        assert_eq!(last.begin, vec![8, 6]);
        assert_eq!(last.end, vec![10, 7]);
        assert_eq!(last.shape(), vec![2, 1]);
        assert_exact_cover(&blocking);
    }

    #[test]
    fn region_of_interest() {
        let roi = Roi::new([10, 0, 0], [60, 100, 100]);
        let blocking = Blocking::new(&[100, 100, 100], &[50, 50, 50], Some(roi)).unwrap();
        assert_eq!(blocking.blocks_per_axis(), &[1, 2, 2]);
        for block in blocking.blocks() {
            assert_eq!(block.begin[0], 10);
            assert_eq!(block.end[0], 60);
        }
        assert_exact_cover(&blocking);

        let roi = Roi::new([10, 0, 0], [61, 100, 100]);
        let blocking = Blocking::new(&[100, 100, 100], &[50, 50, 50], Some(roi)).unwrap();
        assert_eq!(blocking.blocks_per_axis(), &[2, 2, 2]);
        assert_eq!(blocking.block(4).unwrap().shape(), vec![1, 50, 50]);
        assert_exact_cover(&blocking);
    }

    #[test]
    fn huge_block_shape() {
        let roi = Roi::new([10], [60]);
        let blocking = Blocking::new(&[100], &[u64::MAX], Some(roi)).unwrap();
        assert_eq!(blocking.num_blocks(), 1);
        assert_eq!(
            blocking.block(0).unwrap(),
            Block {
                id: 0,
                begin: vec![10],
                end: vec![60],
            }
        );

        let blocking = Blocking::new(&[u64::MAX, 7], &[u64::MAX - 1, 3], None).unwrap();
        assert_eq!(blocking.blocks_per_axis(), &[2, 3]);
        assert_eq!(blocking.block(5).unwrap().end, vec![u64::MAX, 7]);
    }

    #[test]
    fn too_many_blocks() {
        assert_eq!(
            Blocking::new(&[u64::MAX, u64::MAX], &[1, 1], None).unwrap_err(),
            InvalidRegionError::TooManyBlocks
        );
    }

    #[test]
    fn empty_region() {
        let roi = Roi::new([5, 0], [5, 10]);
        let blocking = Blocking::new(&[10, 10], &[3, 3], Some(roi)).unwrap();
        assert_eq!(blocking.num_blocks(), 0);
        assert_eq!(blocking.blocks().count(), 0);
    }

    #[test]
    fn exhaustive_cover() {
        for shape in [[1, 1], [7, 5], [16, 9], [3, 12]] {
            for block_shape in [[1, 1], [2, 3], [4, 4], [20, 2]] {
                let blocking = Blocking::new(&shape, &block_shape, None).unwrap();
                assert_exact_cover(&blocking);

                let roi = Roi::new([shape[0] / 3, 1.min(shape[1])], [shape[0], shape[1]]);
                let blocking = Blocking::new(&shape, &block_shape, Some(roi)).unwrap();
                assert_exact_cover(&blocking);
            }
        }
    }

    #[test]
    fn invalid_regions() {
        assert_eq!(
            Blocking::new(&[], &[], None).unwrap_err(),
            InvalidRegionError::EmptyShape
        );
        assert_eq!(
            Blocking::new(&[10, 10], &[5], None).unwrap_err().to_string(),
            "block shape has 1 dimension(s), but the volume has 2"
        );
        assert_eq!(
            Blocking::new(&[10, 10], &[5, 0], None).unwrap_err(),
            InvalidRegionError::ZeroBlockShape { axis: 1 }
        );
        assert_eq!(
            Blocking::new(&[10, 10], &[5, 5], Some(Roi::new([6, 0], [5, 10]))).unwrap_err(),
            InvalidRegionError::InvertedRegion {
                axis: 0,
                begin: 6,
                end: 5
            }
        );
        assert_eq!(
            Blocking::new(&[10, 10], &[5, 5], Some(Roi::new([0, 0], [10, 11])))
                .unwrap_err()
                .to_string(),
            "region of interest ends at 11 along axis 1, past the volume extent of 10"
        );
    }
}
