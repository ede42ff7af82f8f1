//! # State Dict Format
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! magic    8 bytes   "GRAFTDIF"
//! version  u32
//! n_index  u64       length of the index in bytes
//! index    n_index   bincode Vec<Entry>
//! data     ...       raw f32 values, entries back to back
//! ```
//!
//! Values are stored bit for bit, so a save/load round trip is exact.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::{check_available, Device};
use crate::error::{DiffError, Result};
use crate::nn::StateDict;
use crate::tensor::Tensor;

const MAGIC: &[u8; 8] = b"GRAFTDIF";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 8 + 4 + 8;

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    name: String,
    shape: Vec<u64>,
    requires_grad: bool,
    /// Offset into the data section, in elements.
    offset: u64,
    len: u64,
}

/// Encode a state dict.
pub fn save(state: &StateDict) -> Result<Vec<u8>> {
    let mut index = Vec::with_capacity(state.len());
    let mut data: Vec<u8> = Vec::new();
    let mut offset = 0u64;
    for (name, tensor) in state {
        let values = tensor.to_vec();
        let len = values.len() as u64;
        index.push(Entry {
            name: name.clone(),
            shape: tensor.shape().into_iter().map(|d| d as u64).collect(),
            requires_grad: tensor.requires_grad(),
            offset,
            len,
        });
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        offset += len;
    }

    let index = bincode::serialize(&index)?;
    let mut out = Vec::with_capacity(HEADER_LEN + index.len() + data.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&(index.len() as u64).to_le_bytes());
    out.extend_from_slice(&index);
    out.extend_from_slice(&data);
    debug!(tensors = state.len(), bytes = out.len(), "saved state dict");
    Ok(out)
}

/// Decode a state dict, placing every tensor on `map_location`.
pub fn load(bytes: &[u8], map_location: Device) -> Result<StateDict> {
    check_available(map_location)?;
    if bytes.len() < HEADER_LEN || &bytes[..8] != MAGIC {
        return Err(DiffError::Format("missing GRAFTDIF header".into()));
    }
    let version = u32::from_le_bytes(read_array(&bytes[8..12])?);
    if version != VERSION {
        return Err(DiffError::Format(format!("unsupported version {version}")));
    }
    let index_len = u64::from_le_bytes(read_array(&bytes[12..20])?) as usize;
    let data_start = HEADER_LEN
        .checked_add(index_len)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| DiffError::Format("index runs past end of input".into()))?;
    let index: Vec<Entry> = bincode::deserialize(&bytes[HEADER_LEN..data_start])?;
    let data = &bytes[data_start..];

    let mut state = StateDict::new();
    for entry in index {
        let (shape, raw) = entry_data(&entry, data)?;
        let values = raw
            .chunks_exact(4)
            .map(|c| read_array(c).map(f32::from_le_bytes))
            .collect::<Result<Vec<f32>>>()?;
        let tensor = Tensor::from_vec(shape, values)?.requires_grad_(entry.requires_grad);
        tensor.move_to(map_location)?;
        state.insert(entry.name, tensor);
    }
    debug!(tensors = state.len(), device = %map_location, "loaded state dict");
    Ok(state)
}

/// Shape and raw bytes of `entry`, checked against the data section.
fn entry_data<'a>(entry: &Entry, data: &'a [u8]) -> Result<(Vec<usize>, &'a [u8])> {
    let bad = |what: &str| DiffError::Format(format!("{what} for {} out of range", entry.name));
    let shape = entry
        .shape
        .iter()
        .map(|&d| usize::try_from(d).map_err(|_| bad("dimension")))
        .collect::<Result<Vec<usize>>>()?;
    let numel = shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| bad("element count"))?;
    if u64::try_from(numel).ok() != Some(entry.len) {
        return Err(DiffError::Format(format!(
            "{} has shape {:?} but {} values",
            entry.name, shape, entry.len
        )));
    }
    let to_bytes = |n: u64| usize::try_from(n).ok().and_then(|n| n.checked_mul(4));
    let start = to_bytes(entry.offset).ok_or_else(|| bad("offset"))?;
    let end = to_bytes(entry.len)
        .and_then(|len| start.checked_add(len))
        .ok_or_else(|| bad("length"))?;
    let raw = data
        .get(start..end)
        .ok_or_else(|| DiffError::Format(format!("data for {} runs past end of input", entry.name)))?;
    Ok((shape, raw))
}

fn read_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| DiffError::Format(format!("expected {N} bytes, got {}", bytes.len())))
}
