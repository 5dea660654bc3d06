//! Uses the `imageproc` crate to perform region labeling on a label mask.

use super::roi::RasterRoi;
use image::{ImageBuffer, Luma};
use imageproc::definitions::Image;
use imageproc::region_labelling::connected_components;
pub use imageproc::region_labelling::Connectivity;
use ndarray::{Array2, ArrayView2};
use std::collections::HashMap;

/// The result of labeling the connected regions of a mask. Labels run from 1 to `count()` in the
/// raster order of their first pixel, and 0 is background.
#[derive(Debug, Clone)]
pub struct LabeledRegions {
    buffer: Array2<u32>,
    roi: Vec<RasterRoi>,
}

impl LabeledRegions {
    pub fn buffer(&self) -> &Array2<u32> {
        &self.buffer
    }

    pub fn into_buffer(self) -> Array2<u32> {
        self.buffer
    }

    /// The bounding box of each label, indexed by label. Entry 0 is always empty.
    pub fn roi(&self) -> &[RasterRoi] {
        &self.roi
    }

    pub fn count(&self) -> u32 {
        self.roi.len().saturating_sub(1) as u32
    }

    /// Label the connected regions of `mask`. Two neighboring pixels belong to the same region
    /// only when they carry the same non-zero value.
    pub fn from_connected_components(mask: ArrayView2<u32>, conn: Connectivity) -> Self {
        let (height, width) = mask.dim();
        let mut buffer = Array2::zeros((height, width));
        let mut regions = vec![RasterRoi::empty()];
        if height == 0 || width == 0 {
            return Self {
                buffer,
                roi: regions,
            };
        }

        let image: Image<Luma<u32>> = ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
            Luma([mask[(y as usize, x as usize)]])
        });
        let result = connected_components(&image, conn, Luma([0u32]));

        // Compact the labels into raster order of first appearance
        let mut remap: HashMap<u32, u32> = HashMap::new();
        for (x, y, pixel) in result.enumerate_pixels() {
            let vi = pixel[0];
            if vi == 0 {
                continue;
            }

            let label = *remap.entry(vi).or_insert_with(|| {
                regions.push(RasterRoi::empty());
                (regions.len() - 1) as u32
            });
            let (row, col) = (y as usize, x as usize);
            buffer[(row, col)] = label;
            regions[label as usize].expand_to_contain(row, col);
        }

        Self {
            buffer,
            roi: regions,
        }
    }
}

/// Label a mask with 8-connectivity.
pub fn label_components(mask: ArrayView2<u32>) -> LabeledRegions {
    LabeledRegions::from_connected_components(mask, Connectivity::Eight)
}
