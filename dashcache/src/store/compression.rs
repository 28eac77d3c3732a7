// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Value compression for stored entries

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::error::{CacheError, CacheResult};

/// Threshold and zlib level applied to new writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionProfile {
    pub enabled: bool,
    pub threshold_bytes: usize,
    pub level: u32,
}

impl CompressionProfile {
    pub fn should_compress(&self, len: usize) -> bool {
        self.enabled && len > self.threshold_bytes
    }
}

/// Bytes as they will be stored
#[derive(Debug)]
pub(crate) struct EncodedValue {
    pub bytes: Vec<u8>,
    pub compressed: bool,
    pub ratio: Option<f32>,
}

/// Compresses `raw` when the profile asks for it and the result is smaller.
/// The stored size therefore never exceeds the raw size.
pub(crate) fn encode(raw: Vec<u8>, profile: &CompressionProfile) -> EncodedValue {
    if !profile.should_compress(raw.len()) {
        return EncodedValue {
            bytes: raw,
            compressed: false,
            ratio: None,
        };
    }

    match compress(&raw, profile.level) {
        Ok(packed) if packed.len() < raw.len() => {
            let ratio = packed.len() as f32 / raw.len() as f32;
            EncodedValue {
                bytes: packed,
                compressed: true,
                ratio: Some(ratio),
            }
        }
        Ok(_) => EncodedValue {
            bytes: raw,
            compressed: false,
            ratio: Some(1.0),
        },
        Err(e) => {
            log::warn!("Compression failed, storing raw bytes: {}", e);
            EncodedValue {
                bytes: raw,
                compressed: false,
                ratio: None,
            }
        }
    }
}

pub fn compress(data: &[u8], level: u32) -> CacheResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Inflates a stored value and checks it against the recorded length
pub fn decompress(data: &[u8], expected_len: usize) -> CacheResult<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(expected_len);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CacheError::SerializationError(format!("corrupt compressed value: {}", e)))?;

    if out.len() != expected_len {
        return Err(CacheError::SerializationError(format!(
            "decompressed {} bytes, expected {}",
            out.len(),
            expected_len
        )));
    }
    Ok(out)
}
