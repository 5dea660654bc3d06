use ndarray::ArrayView2;
use std::collections::BTreeMap;
use std::ops::Range;

/// A rectangular region of interest in a label mask, in (row, col) pixel indices. The semantics
/// are similar to a bounding box, except that the maximum corner is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterRoi {
    pub min: (usize, usize),
    pub max: (usize, usize),
}

impl RasterRoi {
    pub fn is_empty(&self) -> bool {
        self.min.0 >= self.max.0 || self.min.1 >= self.max.1
    }

    pub fn empty() -> Self {
        Self {
            min: (0, 0),
            max: (0, 0),
        }
    }

    pub fn from_bounds(row_min: usize, col_min: usize, row_max: usize, col_max: usize) -> Self {
        Self {
            min: (row_min, col_min),
            max: (row_max, col_max),
        }
    }

    pub fn rows(&self) -> Range<usize> {
        self.min.0..self.max.0
    }

    pub fn cols(&self) -> Range<usize> {
        self.min.1..self.max.1
    }

    /// The (height, width) of the region
    pub fn extent(&self) -> (usize, usize) {
        (
            self.max.0.saturating_sub(self.min.0),
            self.max.1.saturating_sub(self.min.1),
        )
    }

    pub fn contains_indices(&self, row: usize, col: usize) -> bool {
        self.rows().contains(&row) && self.cols().contains(&col)
    }

    pub fn expand_to_contain(&mut self, row: usize, col: usize) {
        if self.is_empty() {
            self.min = (row, col);
            self.max = (row + 1, col + 1);
        } else {
            self.min.0 = self.min.0.min(row);
            self.min.1 = self.min.1.min(col);
            self.max.0 = self.max.0.max(row + 1);
            self.max.1 = self.max.1.max(col + 1);
        }
    }

    /// Move the region by a non-negative offset.
    pub fn translated(&self, offset: (usize, usize)) -> Self {
        Self {
            min: (self.min.0 + offset.0, self.min.1 + offset.1),
            max: (self.max.0 + offset.0, self.max.1 + offset.1),
        }
    }

    /// Cut the region down so that it lies within a raster of `shape` (height, width). The
    /// minimum corner is kept where it is, so an empty region results if it lies outside.
    pub fn clipped(&self, shape: (usize, usize)) -> Self {
        Self {
            min: self.min,
            max: (self.max.0.min(shape.0), self.max.1.min(shape.1)),
        }
    }
}

impl Default for RasterRoi {
    fn default() -> Self {
        Self::empty()
    }
}

/// The bounding box of every non-zero value in a mask, keyed by value. Pixels sharing a value
/// belong to the same region whether or not they are connected.
pub fn value_regions(mask: ArrayView2<u32>) -> BTreeMap<u32, RasterRoi> {
    let mut regions: BTreeMap<u32, RasterRoi> = BTreeMap::new();
    for ((row, col), &v) in mask.indexed_iter() {
        if v == 0 {
            continue;
        }
        regions.entry(v).or_default().expand_to_contain(row, col);
    }

    regions
}
