//! Coefficient vector layouts and the block splitter.
//!
//! A label vector is a flat run of named 3DMM blocks. The layout fixes the
//! order and size of every block; splitting never reorders or truncates.

use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use thiserror::Error;

/// Number of 2D facial landmarks.
pub const NUM_LANDMARKS: usize = 68;

#[derive(Error, Debug, PartialEq)]
pub enum LayoutError {
    #[error("{layout:?} expects {expected} values, got {actual}")]
    LengthMismatch {
        layout: Layout,
        expected: usize,
        actual: usize,
    },
    #[error("{layout:?} has no {block:?} block")]
    MissingBlock { layout: Layout, block: Block },
    #[error("landmark block must hold {expected} values, got {actual}")]
    Landmarks { expected: usize, actual: usize },
}

/// A named semantic block of the coefficient vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Block {
    Roi,
    Landmarks,
    Pose,
    Shape,
    Expression,
    Color,
    Illumination,
    Texture,
}

impl Block {
    pub fn name(self) -> &'static str {
        match self {
            Block::Roi => "roi",
            Block::Landmarks => "landmark",
            Block::Pose => "pose",
            Block::Shape => "shape",
            Block::Expression => "exp",
            Block::Color => "color",
            Block::Illumination => "illum",
            Block::Texture => "tex",
        }
    }
}

const COMPACT_430: [(Block, usize); 8] = [
    (Block::Roi, 4),
    (Block::Landmarks, 2 * NUM_LANDMARKS),
    (Block::Pose, 7),
    (Block::Shape, 199),
    (Block::Expression, 29),
    (Block::Color, 6),
    (Block::Illumination, 9),
    (Block::Texture, 40),
];

const FULL_587: [(Block, usize); 7] = [
    (Block::Shape, 199),
    (Block::Pose, 7),
    (Block::Expression, 29),
    (Block::Color, 7),
    (Block::Illumination, 10),
    (Block::Landmarks, 2 * NUM_LANDMARKS),
    (Block::Texture, 199),
];

/// Blocks a regression network predicts, in output order.
pub const PREDICTED_BLOCKS: [Block; 6] = [
    Block::Shape,
    Block::Pose,
    Block::Expression,
    Block::Color,
    Block::Illumination,
    Block::Texture,
];

/// Fixed partition of a label vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// 300W-LP / AFLW2000 extractor output: eigen-normalized, 430 values.
    Compact430,
    /// Raw warmup labels: 587 values.
    Full587,
}

impl Layout {
    pub fn blocks(self) -> &'static [(Block, usize)] {
        match self {
            Layout::Compact430 => &COMPACT_430,
            Layout::Full587 => &FULL_587,
        }
    }

    pub fn len(self) -> usize {
        self.blocks().iter().map(|(_, n)| n).sum()
    }

    pub fn block_len(self, block: Block) -> Option<usize> {
        self.range(block).map(|r| r.len())
    }

    /// Index range of `block` inside the flat vector.
    pub fn range(self, block: Block) -> Option<Range<usize>> {
        let mut start = 0;
        for &(b, n) in self.blocks() {
            if b == block {
                return Some(start..start + n);
            }
            start += n;
        }
        None
    }

    /// Whether labels in this layout carry eigenvalue-normalized shape/texture.
    pub fn is_normalized(self) -> bool {
        matches!(self, Layout::Compact430)
    }

    /// Total width of the network output for this layout.
    pub fn predicted_len(self) -> usize {
        PREDICTED_BLOCKS
            .iter()
            .filter_map(|&b| self.block_len(b))
            .sum()
    }

    /// Column range of `block` inside a network output row.
    pub fn predicted_range(self, block: Block) -> Option<Range<usize>> {
        let mut start = 0;
        for &b in &PREDICTED_BLOCKS {
            let n = self.block_len(b)?;
            if b == block {
                return Some(start..start + n);
            }
            start += n;
        }
        None
    }
}

/// Borrowed view of a label vector, split into its blocks.
#[derive(Debug, Clone)]
pub struct Split<'a> {
    layout: Layout,
    parts: Vec<(Block, &'a [f32])>,
}

impl<'a> Split<'a> {
    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn get(&self, block: Block) -> Option<&'a [f32]> {
        self.parts
            .iter()
            .find(|(b, _)| *b == block)
            .map(|(_, v)| *v)
    }

    /// Like [`get`](Self::get) but fails for blocks the layout lacks.
    pub fn require(&self, block: Block) -> Result<&'a [f32], LayoutError> {
        self.get(block).ok_or(LayoutError::MissingBlock {
            layout: self.layout,
            block,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (Block, &'a [f32])> + '_ {
        self.parts.iter().copied()
    }

    /// Concatenate the blocks back in layout order.
    pub fn concat(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.layout.len());
        for (_, part) in &self.parts {
            out.extend_from_slice(part);
        }
        out
    }
}

/// Split a flat label vector into named blocks.
pub fn split(layout: Layout, labels: &[f32]) -> Result<Split<'_>, LayoutError> {
    let expected = layout.len();
    if labels.len() != expected {
        return Err(LayoutError::LengthMismatch {
            layout,
            expected,
            actual: labels.len(),
        });
    }

    let mut parts = Vec::with_capacity(layout.blocks().len());
    let mut rest = labels;
    for &(block, n) in layout.blocks() {
        let (head, tail) = rest.split_at(n);
        parts.push((block, head));
        rest = tail;
    }

    Ok(Split { layout, parts })
}

/// Split a batch (one label vector per row) into per-block column views.
pub fn split_rows<'a>(
    layout: Layout,
    labels: &'a ArrayView2<'a, f32>,
) -> Result<Vec<(Block, ArrayView2<'a, f32>)>, LayoutError> {
    let expected = layout.len();
    if labels.ncols() != expected {
        return Err(LayoutError::LengthMismatch {
            layout,
            expected,
            actual: labels.ncols(),
        });
    }

    let mut start = 0;
    let views = layout
        .blocks()
        .iter()
        .map(|&(block, n)| {
            let view = labels.slice(s![.., start..start + n]);
            start += n;
            (block, view)
        })
        .collect();
    Ok(views)
}

/// Reshape a flat 136-value landmark block into a (2, 68) array.
///
/// Row 0 holds x coordinates, row 1 holds y coordinates.
pub fn landmarks_2xn(flat: &[f32]) -> Result<Array2<f32>, LayoutError> {
    let expected = 2 * NUM_LANDMARKS;
    if flat.len() != expected {
        return Err(LayoutError::Landmarks {
            expected,
            actual: flat.len(),
        });
    }
    Array2::from_shape_vec((2, NUM_LANDMARKS), flat.to_vec()).map_err(|_| LayoutError::Landmarks {
        expected,
        actual: flat.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| i as f32 * 0.5 - 7.0).collect()
    }

    #[test]
    fn test_layout_lengths() {
        assert_eq!(Layout::Compact430.len(), 430);
        assert_eq!(Layout::Full587.len(), 587);
    }

    #[test]
    fn test_compact_ranges() {
        let l = Layout::Compact430;
        assert_eq!(l.range(Block::Roi), Some(0..4));
        assert_eq!(l.range(Block::Landmarks), Some(4..140));
        assert_eq!(l.range(Block::Pose), Some(140..147));
        assert_eq!(l.range(Block::Shape), Some(147..346));
        assert_eq!(l.range(Block::Expression), Some(346..375));
        assert_eq!(l.range(Block::Color), Some(375..381));
        assert_eq!(l.range(Block::Illumination), Some(381..390));
        assert_eq!(l.range(Block::Texture), Some(390..430));
    }

    #[test]
    fn test_full_ranges() {
        let l = Layout::Full587;
        assert_eq!(l.range(Block::Roi), None);
        assert_eq!(l.range(Block::Shape), Some(0..199));
        assert_eq!(l.range(Block::Pose), Some(199..206));
        assert_eq!(l.range(Block::Expression), Some(206..235));
        assert_eq!(l.range(Block::Color), Some(235..242));
        assert_eq!(l.range(Block::Illumination), Some(242..252));
        assert_eq!(l.range(Block::Landmarks), Some(252..388));
        assert_eq!(l.range(Block::Texture), Some(388..587));
    }

    #[test]
    fn test_split_concat_roundtrip_both_layouts() {
        for layout in [Layout::Compact430, Layout::Full587] {
            let v = ramp(layout.len());
            let parts = split(layout, &v).unwrap();
            assert_eq!(parts.concat(), v);
        }
    }

    #[test]
    fn test_split_block_contents() {
        let v = ramp(430);
        let parts = split(Layout::Compact430, &v).unwrap();
        assert_eq!(parts.get(Block::Pose).unwrap(), &v[140..147]);
        assert_eq!(parts.require(Block::Texture).unwrap().len(), 40);
    }

    #[test]
    fn test_split_rejects_wrong_length() {
        let v = ramp(431);
        let err = split(Layout::Compact430, &v).unwrap_err();
        assert_eq!(
            err,
            LayoutError::LengthMismatch {
                layout: Layout::Compact430,
                expected: 430,
                actual: 431
            }
        );
    }

    #[test]
    fn test_require_missing_block() {
        let v = ramp(587);
        let parts = split(Layout::Full587, &v).unwrap();
        assert!(parts.require(Block::Roi).is_err());
    }

    #[test]
    fn test_split_rows_columns() {
        let batch = Array2::from_shape_fn((3, 430), |(r, c)| (r * 1000 + c) as f32);
        let view = batch.view();
        let cols = split_rows(Layout::Compact430, &view).unwrap();
        let (block, pose) = &cols[2];
        assert_eq!(*block, Block::Pose);
        assert_eq!(pose.shape(), &[3, 7]);
        assert_eq!(pose[[2, 0]], 2140.0);
    }

    #[test]
    fn test_predicted_layout() {
        assert_eq!(Layout::Compact430.predicted_len(), 199 + 7 + 29 + 6 + 9 + 40);
        assert_eq!(Layout::Full587.predicted_len(), 199 + 7 + 29 + 7 + 10 + 199);
        assert_eq!(Layout::Compact430.predicted_range(Block::Pose), Some(199..206));
        assert_eq!(Layout::Compact430.predicted_range(Block::Roi), None);
    }

    #[test]
    fn test_landmarks_reshape() {
        let flat: Vec<f32> = (0..136).map(|i| i as f32).collect();
        let lm = landmarks_2xn(&flat).unwrap();
        assert_eq!(lm[[0, 0]], 0.0);
        assert_eq!(lm[[1, 0]], 68.0);
        assert!(landmarks_2xn(&flat[..10]).is_err());
    }
}
