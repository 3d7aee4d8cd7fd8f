// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Dataset handle and the ordinary, filtered chunk path.

use crate::error::{ChunkError, Result};
use crate::storage::container::Container;
use crate::storage::layout::DatasetSpec;

/// A chunked dataset inside an open [`Container`].
#[derive(Clone)]
pub struct Dataset {
    container: Container,
    name: String,
    spec: DatasetSpec,
}

impl Dataset {
    pub(crate) fn new(container: Container, name: &str, spec: DatasetSpec) -> Self {
        Self { container, name: name.to_string(), spec }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &DatasetSpec {
        &self.spec
    }

    pub fn shape(&self) -> &[u64] {
        &self.spec.shape
    }

    pub fn chunk_shape(&self) -> &[u64] {
        &self.spec.chunk_shape
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Encode `data` through the filter pipeline and store it at `offset`.
    ///
    /// `data` must hold exactly one full chunk.
    pub fn write_chunk(&self, offset: &[u64], data: &[u8]) -> Result<()> {
        self.spec.check_offset(offset)?;
        let expected = self.spec.chunk_nbytes();
        if data.len() != expected {
            return Err(ChunkError::Storage(format!(
                "chunk data is {} bytes, dataset '{}' expects {expected}",
                data.len(),
                self.name
            )));
        }
        let (stored, mask) = self.spec.pipeline.encode(data)?;
        self.container.append_chunk(&self.name, offset, &stored, mask)?;
        Ok(())
    }

    /// Read the chunk at `offset` and undo the filters recorded in its mask.
    pub fn read_chunk(&self, offset: &[u64]) -> Result<Vec<u8>> {
        let (mask, stored) = self.read_raw_chunk(offset)?;
        let data = self.spec.pipeline.decode(&stored, mask)?;
        if data.len() != self.spec.chunk_nbytes() {
            return Err(ChunkError::Storage(format!(
                "decoded chunk at {offset:?} is {} bytes, expected {}",
                data.len(),
                self.spec.chunk_nbytes()
            )));
        }
        Ok(data)
    }
}
