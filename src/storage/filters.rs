// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Filter pipeline applied to chunk payloads on the ordinary (non-direct) path.
//!
//! Stages run in declaration order when encoding and in reverse when decoding.
//! Bit `i` of a chunk's filter mask is set when stage `i` was **not** applied
//! to the stored bytes.

use tracing::debug;

use crate::error::{ChunkError, Result};

pub const FILTER_CHECKSUM: u16 = 3;
pub const FILTER_ZSTD: u16 = 32015;

/// A mask with every bit set: no stage was applied.
pub const DISABLE_ALL_FILTERS: u32 = 0xFFFF_FFFF;

/// Masks are 32 bits wide, so at most 32 stages can be tracked.
pub const MAX_FILTERS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// Zstandard compression. Skipped for a chunk when it would not shrink it.
    Zstd { level: i32 },
    /// CRC-32 of the preceding stage's output, appended little-endian.
    Checksum,
}

impl Filter {
    pub fn id(&self) -> u16 {
        match self {
            Filter::Zstd { .. } => FILTER_ZSTD,
            Filter::Checksum => FILTER_CHECKSUM,
        }
    }

    pub(crate) fn param(&self) -> i32 {
        match self {
            Filter::Zstd { level } => *level,
            Filter::Checksum => 0,
        }
    }

    pub(crate) fn from_parts(id: u16, param: i32) -> Result<Self> {
        match id {
            FILTER_ZSTD => Ok(Filter::Zstd { level: param }),
            FILTER_CHECKSUM => Ok(Filter::Checksum),
            other => Err(ChunkError::Storage(format!("unknown filter id {other}"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterPipeline {
    filters: Vec<Filter>,
}

impl FilterPipeline {
    pub fn new(filters: Vec<Filter>) -> Result<Self> {
        if filters.len() > MAX_FILTERS {
            return Err(ChunkError::Config(format!(
                "a pipeline holds at most {MAX_FILTERS} filters, got {}",
                filters.len()
            )));
        }
        Ok(Self { filters })
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Run every stage over `data`. Returns the stored bytes and the filter mask.
    pub fn encode(&self, data: &[u8]) -> Result<(Vec<u8>, u32)> {
        let mut mask = 0u32;
        let mut buf = data.to_vec();
        for (i, filter) in self.filters.iter().enumerate() {
            match filter {
                Filter::Zstd { level } => {
                    let out = zstd::encode_all(&buf[..], *level)?;
                    if out.len() >= buf.len() {
                        debug!(stage = i, size = buf.len(), "zstd output not smaller, stage skipped");
                        mask |= 1 << i;
                    } else {
                        buf = out;
                    }
                }
                Filter::Checksum => {
                    let crc = crc32fast::hash(&buf);
                    buf.extend_from_slice(&crc.to_le_bytes());
                }
            }
        }
        Ok((buf, mask))
    }

    /// Undo every stage not flagged in `mask`.
    pub fn decode(&self, stored: &[u8], mask: u32) -> Result<Vec<u8>> {
        let mut buf = stored.to_vec();
        for (i, filter) in self.filters.iter().enumerate().rev() {
            if mask & (1 << i) != 0 {
                continue;
            }
            match filter {
                Filter::Zstd { .. } => {
                    buf = zstd::decode_all(&buf[..])?;
                }
                Filter::Checksum => {
                    if buf.len() < 4 {
                        return Err(ChunkError::Storage(
                            "chunk too short to carry a checksum".into(),
                        ));
                    }
                    let split = buf.len() - 4;
                    let stored_crc = u32::from_le_bytes([
                        buf[split],
                        buf[split + 1],
                        buf[split + 2],
                        buf[split + 3],
                    ]);
                    buf.truncate(split);
                    let actual = crc32fast::hash(&buf);
                    if actual != stored_crc {
                        return Err(ChunkError::Storage(format!(
                            "checksum mismatch: stored {stored_crc:#010x}, computed {actual:#010x}"
                        )));
                    }
                }
            }
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incompressible_stage_is_masked() {
        let pipeline = FilterPipeline::new(vec![Filter::Zstd { level: 3 }]).unwrap();
        // Four bytes never shrink under zstd framing.
        let (stored, mask) = pipeline.encode(&[1, 2, 3, 4]).unwrap();
        assert_eq!(mask, 1);
        assert_eq!(stored, vec![1, 2, 3, 4]);
        assert_eq!(pipeline.decode(&stored, mask).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let pipeline =
            FilterPipeline::new(vec![Filter::Zstd { level: 9 }, Filter::Checksum]).unwrap();
        let data = vec![7u8; 256];
        let (mut stored, mask) = pipeline.encode(&data).unwrap();
        assert_eq!(mask, 0);
        assert_eq!(pipeline.decode(&stored, mask).unwrap(), data);

        let last = stored.len() - 1;
        stored[last] ^= 0xFF;
        assert!(matches!(pipeline.decode(&stored, mask), Err(ChunkError::Storage(_))));
    }

    #[test]
    fn test_all_disabled_mask_passes_bytes_through() {
        let pipeline =
            FilterPipeline::new(vec![Filter::Zstd { level: 9 }, Filter::Checksum]).unwrap();
        let raw = b"plain bytes".to_vec();
        assert_eq!(pipeline.decode(&raw, DISABLE_ALL_FILTERS).unwrap(), raw);
    }
}
