// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Direct chunk access: read and write a chunk's stored bytes as they sit on
//! disk, bypassing the dataset's filter pipeline.
//!
//! The filter mask travels with the bytes. Bit `i` set means pipeline stage
//! `i` was not applied; [`DISABLE_ALL_FILTERS`](crate::storage::filters::DISABLE_ALL_FILTERS)
//! marks a chunk stored uncompressed. Moving a chunk between two datasets
//! with the same pipeline is a `read_raw_chunk` + `write_raw_chunk` pair with
//! no decode/re-encode in between.
//!
//! Allocation made through one container handle is visible to that handle
//! immediately. Other handles on the same file observe it only after
//! [`Container::refresh`](crate::storage::container::Container::refresh) or a
//! reopen.

use bytes::BytesMut;
use serde::Serialize;
use tracing::debug;

use crate::error::{ChunkError, Result};
use crate::storage::dataset::Dataset;
use crate::storage::index::ChunkLocation;

/// Stored-chunk metadata, without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkMetadata {
    /// Stored (possibly filtered) size in bytes.
    pub byte_size: u64,
    pub filter_mask: u32,
    /// Byte offset of the payload inside the container file.
    pub storage_address: u64,
}

impl From<ChunkLocation> for ChunkMetadata {
    fn from(loc: ChunkLocation) -> Self {
        Self {
            byte_size: loc.size,
            filter_mask: loc.filter_mask,
            storage_address: loc.address,
        }
    }
}

/// Metadata of an allocated chunk together with its offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkInfo {
    pub chunk_offset: Vec<u64>,
    #[serde(flatten)]
    pub meta: ChunkMetadata,
}

/// A caller-owned, pre-sized byte destination for [`Dataset::read_raw_chunk_into`].
///
/// Capacity is the current length of the exposed slice; nothing is resized.
pub trait RawChunkBuffer {
    fn as_mut_bytes(&mut self) -> &mut [u8];

    fn capacity_bytes(&mut self) -> usize {
        self.as_mut_bytes().len()
    }
}

impl RawChunkBuffer for [u8] {
    fn as_mut_bytes(&mut self) -> &mut [u8] {
        self
    }
}

impl<const N: usize> RawChunkBuffer for [u8; N] {
    fn as_mut_bytes(&mut self) -> &mut [u8] {
        self
    }
}

impl RawChunkBuffer for Vec<u8> {
    fn as_mut_bytes(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl RawChunkBuffer for BytesMut {
    fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self[..]
    }
}

impl Dataset {
    fn locate(&self, offset: &[u64]) -> Result<ChunkLocation> {
        self.spec().check_offset(offset)?;
        self.container()
            .chunk_location(self.name(), offset)
            .ok_or_else(|| ChunkError::NotAllocated { offset: offset.to_vec() })
    }

    /// Stored bytes of the chunk at `offset` and the mask they were stored with.
    pub fn read_raw_chunk(&self, offset: &[u64]) -> Result<(u32, Vec<u8>)> {
        let loc = self.locate(offset)?;
        let mut data = vec![0u8; loc.size as usize];
        self.container().read_at(loc.address, &mut data)?;
        Ok((loc.filter_mask, data))
    }

    /// Read the stored bytes of the chunk at `offset` into `buffer`.
    ///
    /// Returns the filter mask and the number of bytes written, which is
    /// always the chunk's stored size. Bytes of `buffer` past that size are
    /// left untouched.
    pub fn read_raw_chunk_into<B>(&self, offset: &[u64], buffer: &mut B) -> Result<(u32, usize)>
    where
        B: RawChunkBuffer + ?Sized,
    {
        let loc = self.locate(offset)?;
        let needed = loc.size as usize;
        let capacity = buffer.capacity_bytes();
        if capacity < needed {
            return Err(ChunkError::BufferTooSmall { needed, capacity });
        }
        self.container()
            .read_at(loc.address, &mut buffer.as_mut_bytes()[..needed])?;
        Ok((loc.filter_mask, needed))
    }

    /// Store `data` verbatim as the chunk at `offset`, recording `filter_mask`.
    ///
    /// The bytes are not checked against the dataset's filter pipeline; they
    /// must already be in the form the mask describes.
    pub fn write_raw_chunk(&self, offset: &[u64], data: &[u8], filter_mask: u32) -> Result<()> {
        self.spec().check_offset(offset)?;
        let loc = self
            .container()
            .append_chunk(self.name(), offset, data, filter_mask)?;
        debug!(
            dataset = self.name(),
            offset = ?offset,
            bytes = data.len(),
            filter_mask,
            address = loc.address,
            "Raw chunk written"
        );
        Ok(())
    }

    pub fn get_chunk_metadata(&self, offset: &[u64]) -> Result<ChunkMetadata> {
        self.locate(offset).map(ChunkMetadata::from)
    }

    /// Number of chunks with allocated storage.
    pub fn num_chunks(&self) -> usize {
        self.container().chunk_count(self.name())
    }

    /// Metadata of the `index`-th allocated chunk in chunk-grid order.
    pub fn get_chunk_info(&self, index: usize) -> Result<ChunkInfo> {
        let (chunk_offset, loc) = self
            .container()
            .nth_chunk(self.name(), index)
            .ok_or_else(|| {
                ChunkError::InvalidOffset(format!(
                    "chunk index {index} out of range, {} chunks allocated",
                    self.num_chunks()
                ))
            })?;
        Ok(ChunkInfo { chunk_offset, meta: loc.into() })
    }
}
