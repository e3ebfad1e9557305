use std::path::Path;

use candle_core::{Device, Shape, Tensor};

use crate::error::DetectError;

/// Sequential reader over the parameters of a Darknet `.weights` file.
///
/// The file starts with `major`, `minor` and `revision` as `i32`, followed by
/// the number of images seen during training (`u64` from version 0.2 on,
/// `u32` before), then a flat little-endian `f32` stream consumed layer by
/// layer in config order.
pub struct WeightsReader {
    version: (i32, i32, i32),
    values: Vec<f32>,
    offset: usize,
}

impl WeightsReader {
    /// Read a `.weights` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DetectError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| DetectError::from_io(e, path))?;
        Self::from_bytes(&bytes)
    }

    /// Parse the content of a `.weights` file.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DetectError> {
        let header_i32 = |at: usize| -> Result<i32, DetectError> {
            bytes
                .get(at..at + 4)
                .and_then(|b| b.try_into().ok())
                .map(i32::from_le_bytes)
                .ok_or_else(|| DetectError::InvalidWeights("truncated header".to_string()))
        };
        let major = header_i32(0)?;
        let minor = header_i32(4)?;
        let revision = header_i32(8)?;

        let version = i64::from(major) * 10 + i64::from(minor);
        let seen_len = if version >= 2 && major < 1000 && minor < 1000 {
            8
        } else {
            4
        };
        let body = bytes
            .get(12 + seen_len..)
            .ok_or_else(|| DetectError::InvalidWeights("truncated header".to_string()))?;
        if body.len() % 4 != 0 {
            return Err(DetectError::InvalidWeights(format!(
                "parameter section of {} bytes is not a whole number of f32",
                body.len()
            )));
        }

        let values = body
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self {
            version: (major, minor, revision),
            values,
            offset: 0,
        })
    }

    /// The `(major, minor, revision)` version of the file.
    pub fn version(&self) -> (i32, i32, i32) {
        self.version
    }

    /// Number of parameters not consumed yet.
    pub fn remaining(&self) -> usize {
        self.values.len() - self.offset
    }

    /// Consume the next `shape.elem_count()` values as a tensor.
    pub fn take<S: Into<Shape>>(
        &mut self,
        shape: S,
        device: &Device,
    ) -> Result<Tensor, DetectError> {
        let shape = shape.into();
        let count = shape.elem_count();
        if count > self.remaining() {
            return Err(DetectError::InvalidWeights(format!(
                "needed {count} values at offset {} but only {} remain",
                self.offset,
                self.remaining()
            )));
        }
        let data = self.values[self.offset..self.offset + count].to_vec();
        self.offset += count;
        Ok(Tensor::from_vec(data, shape, device)?)
    }
}

#[cfg(test)]
pub(crate) fn weights_bytes(version: (i32, i32, i32), values: &[f32]) -> Vec<u8> {
    let (major, minor, revision) = version;
    let mut bytes = Vec::new();
    for v in [major, minor, revision] {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    if i64::from(major) * 10 + i64::from(minor) >= 2 && major < 1000 && minor < 1000 {
        bytes.extend_from_slice(&1000u64.to_le_bytes());
    } else {
        bytes.extend_from_slice(&1000u32.to_le_bytes());
    }
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}
