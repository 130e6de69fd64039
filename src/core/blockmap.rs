//! Block-map data: the byte ranges a sparse write actually touched, each with
//! its own digest.
//!
//! Producing a block-map from an image is the job of an external codec; this
//! module only holds the manifest and the helpers the verifier and the sparse
//! read streams need.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::checksum::ChecksumAlgorithm;

/// One written byte range and the digest of its contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedRange {
    pub start: u64,
    pub length: u64,
    pub checksum: String,
}

impl MappedRange {
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMap {
    /// Size of the full image the map describes.
    pub image_size: u64,
    #[serde(default)]
    pub algorithm: ChecksumAlgorithm,
    pub ranges: Vec<MappedRange>,
}

impl BlockMap {
    pub fn new(image_size: u64, algorithm: ChecksumAlgorithm) -> Self {
        Self {
            image_size,
            algorithm,
            ranges: Vec::new(),
        }
    }

    /// Record that `data` was written at `start`.
    pub fn push_range(&mut self, start: u64, data: &[u8]) {
        self.ranges.push(MappedRange {
            start,
            length: data.len() as u64,
            checksum: self.algorithm.digest(data),
        });
    }

    pub fn with_range(mut self, start: u64, data: &[u8]) -> Self {
        self.push_range(start, data);
        self
    }

    /// Total number of bytes covered by the map.
    pub fn mapped_bytes(&self) -> u64 {
        self.ranges.iter().map(|r| r.length).sum()
    }

    /// Split every range into `(position, length)` reads of at most
    /// `chunk_size` bytes, in map order.
    pub fn pieces(&self, chunk_size: usize) -> VecDeque<(u64, usize)> {
        let chunk = chunk_size.max(1) as u64;
        let mut pieces = VecDeque::new();
        for range in &self.ranges {
            let mut position = range.start;
            while position < range.end() {
                let length = chunk.min(range.end() - position);
                pieces.push_back((position, length as usize));
                position += length;
            }
        }
        pieces
    }
}
