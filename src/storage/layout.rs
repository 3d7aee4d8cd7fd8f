// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Dataset layout: fixed shape, chunk shape and element size.
//!
//! Chunk offsets are expressed in dataset index space, so every valid offset
//! is a multiple of the chunk shape along each axis and lies inside the shape.

use crate::error::{ChunkError, Result};
use crate::storage::filters::FilterPipeline;

/// Everything needed to create a chunked dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSpec {
    pub shape: Vec<u64>,
    pub chunk_shape: Vec<u64>,
    /// Size of one element in bytes.
    pub element_size: u32,
    pub pipeline: FilterPipeline,
}

impl DatasetSpec {
    pub fn new(shape: &[u64], chunk_shape: &[u64], element_size: u32) -> Self {
        Self {
            shape: shape.to_vec(),
            chunk_shape: chunk_shape.to_vec(),
            element_size,
            pipeline: FilterPipeline::default(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: FilterPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.shape.is_empty() || self.shape.len() > u8::MAX as usize {
            return Err(ChunkError::Config(format!(
                "dataset rank must be within 1..=255, got {}",
                self.shape.len()
            )));
        }
        if self.chunk_shape.len() != self.shape.len() {
            return Err(ChunkError::Config(format!(
                "chunk rank {} does not match dataset rank {}",
                self.chunk_shape.len(),
                self.shape.len()
            )));
        }
        if self.chunk_shape.iter().any(|&c| c == 0) {
            return Err(ChunkError::Config("chunk dimensions must be > 0".into()));
        }
        if self.element_size == 0 {
            return Err(ChunkError::Config("element_size must be > 0".into()));
        }
        Ok(())
    }

    /// Uncompressed size of one full chunk in bytes.
    pub fn chunk_nbytes(&self) -> usize {
        self.chunk_shape.iter().product::<u64>() as usize * self.element_size as usize
    }

    /// Number of chunks along each axis.
    pub fn chunk_grid(&self) -> Vec<u64> {
        self.shape
            .iter()
            .zip(&self.chunk_shape)
            .map(|(&s, &c)| s.div_ceil(c))
            .collect()
    }

    /// Check that `offset` names an existing chunk boundary.
    pub fn check_offset(&self, offset: &[u64]) -> Result<()> {
        if offset.len() != self.shape.len() {
            return Err(ChunkError::InvalidOffset(format!(
                "offset {offset:?} has rank {}, dataset has rank {}",
                offset.len(),
                self.shape.len()
            )));
        }
        for (axis, ((&o, &s), &c)) in offset
            .iter()
            .zip(&self.shape)
            .zip(&self.chunk_shape)
            .enumerate()
        {
            if o >= s {
                return Err(ChunkError::InvalidOffset(format!(
                    "offset {offset:?} is outside the dataset shape {:?} on axis {axis}",
                    self.shape
                )));
            }
            if o % c != 0 {
                return Err(ChunkError::InvalidOffset(format!(
                    "offset {offset:?} is not aligned to chunk shape {:?} on axis {axis}",
                    self.chunk_shape
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_offset() {
        let spec = DatasetSpec::new(&[10, 8, 8], &[1, 4, 4], 4);
        assert!(spec.check_offset(&[3, 4, 0]).is_ok());
        assert!(matches!(spec.check_offset(&[0, 2, 0]), Err(ChunkError::InvalidOffset(_))));
        assert!(matches!(spec.check_offset(&[10, 0, 0]), Err(ChunkError::InvalidOffset(_))));
        assert!(matches!(spec.check_offset(&[0, 0]), Err(ChunkError::InvalidOffset(_))));
    }

    #[test]
    fn test_chunk_grid_rounds_up() {
        let spec = DatasetSpec::new(&[10, 10], &[4, 4], 8);
        assert_eq!(spec.chunk_grid(), vec![3, 3]);
        assert_eq!(spec.chunk_nbytes(), 128);
    }
}
