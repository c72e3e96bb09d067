//! Int8 mobile artifact (`.jdq`).
//!
//! Layout: `JDQ1` magic, little-endian `u32` header length, JSON header, then
//! the int8 payload of every tensor back to back in header order.
//! Weights use per-tensor symmetric quantization (`q = round(w / scale)`,
//! zero point 0). Input and outputs carry affine uint8 parameters
//! (`real = scale * (q - zero_point)`).

use models::{ArchitectureSpec, NamedTensor};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

pub const MAGIC: &[u8; 4] = b"JDQ1";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineParams {
    pub scale: f32,
    pub zero_point: u8,
}

impl AffineParams {
    /// uint8 parameters covering `[min, max]`, widened to include 0.
    pub fn from_range(min: f32, max: f32) -> Self {
        let min = min.min(0.0);
        let max = max.max(0.0);
        let scale = if max > min { (max - min) / 255.0 } else { 1.0 / 255.0 };
        let zero_point = (-min / scale).round().clamp(0.0, 255.0) as u8;
        Self { scale, zero_point }
    }

    pub fn quantize(&self, value: f32) -> u8 {
        (value / self.scale + self.zero_point as f32)
            .round()
            .clamp(0.0, 255.0) as u8
    }

    pub fn dequantize(&self, q: u8) -> f32 {
        self.scale * (q as f32 - self.zero_point as f32)
    }
}

/// Observed value range of one stream of floats.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeObserver {
    pub min: f32,
    pub max: f32,
    pub count: usize,
}

impl Default for RangeObserver {
    fn default() -> Self {
        Self {
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
            count: 0,
        }
    }
}

impl RangeObserver {
    pub fn observe(&mut self, values: &[f32]) {
        for &v in values.iter().filter(|v| v.is_finite()) {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
            self.count += 1;
        }
    }

    pub fn params(&self) -> AffineParams {
        if self.count == 0 {
            AffineParams::from_range(0.0, 1.0)
        } else {
            AffineParams::from_range(self.min, self.max)
        }
    }
}

/// Per-tensor symmetric int8: returns `(values, scale)`.
pub fn quantize_symmetric(values: &[f32]) -> (Vec<i8>, f32) {
    let max_abs = values
        .iter()
        .filter(|v| v.is_finite())
        .fold(0.0f32, |m, v| m.max(v.abs()));
    let scale = if max_abs > 0.0 { max_abs / 127.0 } else { 1.0 };
    let q = values
        .iter()
        .map(|v| (v / scale).round().clamp(-127.0, 127.0) as i8)
        .collect();
    (q, scale)
}

pub fn dequantize_symmetric(values: &[i8], scale: f32) -> Vec<f32> {
    values.iter().map(|&q| q as f32 * scale).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorEntry {
    pub name: String,
    pub shape: Vec<usize>,
    pub scale: f32,
    /// Byte offset into the payload.
    pub offset: usize,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputParams {
    pub boxes: AffineParams,
    pub confidence: AffineParams,
    pub class_probs: AffineParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JdqHeader {
    pub architecture: ArchitectureSpec,
    pub class_names: Vec<String>,
    pub input: AffineParams,
    pub outputs: OutputParams,
    pub calibration_samples: usize,
    pub tensors: Vec<TensorEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedModel {
    pub header: JdqHeader,
    pub payload: Vec<i8>,
}

impl QuantizedModel {
    /// Quantize every tensor; `header.tensors` is filled in here.
    pub fn quantize(mut header: JdqHeader, tensors: &[NamedTensor]) -> Self {
        let mut payload = Vec::with_capacity(tensors.iter().map(NamedTensor::len).sum());
        header.tensors.clear();
        for t in tensors {
            let (q, scale) = quantize_symmetric(&t.values);
            header.tensors.push(TensorEntry {
                name: t.name.clone(),
                shape: t.shape.clone(),
                scale,
                offset: payload.len(),
                len: q.len(),
            });
            payload.extend_from_slice(&q);
        }
        Self { header, payload }
    }

    /// Float tensors reconstructed from the int8 payload.
    pub fn dequantized(&self) -> Vec<NamedTensor> {
        self.header
            .tensors
            .iter()
            .map(|e| {
                let end = (e.offset + e.len).min(self.payload.len());
                let start = e.offset.min(end);
                NamedTensor {
                    name: e.name.clone(),
                    shape: e.shape.clone(),
                    values: dequantize_symmetric(&self.payload[start..end], e.scale),
                }
            })
            .collect()
    }

    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let header = serde_json::to_vec(&self.header).map_err(io::Error::other)?;
        let header_len = u32::try_from(header.len()).map_err(io::Error::other)?;
        let mut out = Vec::with_capacity(8 + header.len() + self.payload.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&header_len.to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(bytemuck::cast_slice(&self.payload));
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());
        if bytes.len() < 8 || &bytes[..4] != MAGIC {
            return Err(invalid("not a jdq artifact"));
        }
        let header_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let body = &bytes[8..];
        if body.len() < header_len {
            return Err(invalid("truncated jdq header"));
        }
        let header: JdqHeader = serde_json::from_slice(&body[..header_len])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let payload: Vec<i8> = bytemuck::cast_slice(&body[header_len..]).to_vec();
        if header
            .tensors
            .iter()
            .any(|e| e.offset + e.len > payload.len())
        {
            return Err(invalid("jdq payload shorter than its tensor table"));
        }
        Ok(Self { header, payload })
    }

    pub fn write(&self, path: &Path) -> io::Result<u64> {
        let bytes = self.to_bytes()?;
        fs::write(path, &bytes)?;
        Ok(bytes.len() as u64)
    }

    pub fn read(path: &Path) -> io::Result<Self> {
        Self::from_bytes(&fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_round_trip_error_is_within_half_a_step() {
        let values: Vec<f32> = (0..200).map(|i| ((i as f32) * 0.37).sin() * 3.1).collect();
        let (q, scale) = quantize_symmetric(&values);
        let back = dequantize_symmetric(&q, scale);
        for (a, b) in values.iter().zip(&back) {
            assert!((a - b).abs() <= scale / 2.0 + 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn all_zero_tensor_keeps_a_usable_scale() {
        let (q, scale) = quantize_symmetric(&[0.0; 8]);
        assert_eq!(scale, 1.0);
        assert!(q.iter().all(|&v| v == 0));
    }

    #[test]
    fn affine_params_cover_the_observed_range() {
        let mut obs = RangeObserver::default();
        obs.observe(&[0.0, 0.25, 1.0]);
        let p = obs.params();
        assert_eq!(p.zero_point, 0);
        assert_eq!(p.quantize(1.0), 255);
        assert!((p.dequantize(p.quantize(0.25)) - 0.25).abs() <= p.scale / 2.0 + 1e-6);

        let p = AffineParams::from_range(-1.0, 1.0);
        assert!((p.dequantize(p.zero_point)).abs() < 1e-6);
    }
}
