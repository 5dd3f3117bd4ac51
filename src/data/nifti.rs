//! Minimal NIfTI-1 and CSV readers.
//!
//! Volumes are returned channel-first with spatial axes in `[x, y, z]`
//! order and the last axis varying fastest.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{NodeError, NodeResult};
use crate::tensor::Tensor;

const HEADER_SIZE: usize = 348;
const DATA_OFFSET: usize = 352;

const DT_UINT8: i16 = 2;
const DT_INT16: i16 = 4;
const DT_INT32: i16 = 8;
const DT_FLOAT32: i16 = 16;
const DT_FLOAT64: i16 = 64;
const DT_INT8: i16 = 256;
const DT_UINT16: i16 = 512;
const DT_UINT32: i16 = 768;

/// A decoded image: channel-first sample `[C, S...]`.
#[derive(Debug, Clone)]
pub struct Volume {
    pub sample: Tensor,
    /// Voxels were stored as integers (label maps); resize with nearest.
    pub integer: bool,
}

fn read_bytes(path: &Path) -> NodeResult<Vec<u8>> {
    let mut raw = Vec::new();
    File::open(path)?.read_to_end(&mut raw)?;
    if is_gzip(path) {
        let mut out = Vec::new();
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| NodeError::NiftiError(format!("{}: {}", path.display(), e)))?;
        Ok(out)
    } else {
        Ok(raw)
    }
}

fn is_gzip(path: &Path) -> bool {
    path.extension().map_or(false, |e| e == "gz")
}

struct Header<'a> {
    bytes: &'a [u8],
    little: bool,
}

impl<'a> Header<'a> {
    fn i16_at(&self, at: usize) -> i16 {
        let b = [self.bytes[at], self.bytes[at + 1]];
        if self.little {
            i16::from_le_bytes(b)
        } else {
            i16::from_be_bytes(b)
        }
    }

    fn f32_at(&self, at: usize) -> f32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.bytes[at..at + 4]);
        if self.little {
            f32::from_le_bytes(b)
        } else {
            f32::from_be_bytes(b)
        }
    }
}

fn decode_voxels(bytes: &[u8], datatype: i16, little: bool, count: usize) -> NodeResult<(Vec<f32>, bool)> {
    macro_rules! decode {
        ($t:ty, $n:expr) => {{
            let needed = count * $n;
            if bytes.len() < needed {
                return Err(NodeError::NiftiError(format!(
                    "expected {} bytes of voxel data, found {}",
                    needed,
                    bytes.len()
                )));
            }
            bytes[..needed]
                .chunks_exact($n)
                .map(|c| {
                    let mut b = [0u8; $n];
                    b.copy_from_slice(c);
                    (if little { <$t>::from_le_bytes(b) } else { <$t>::from_be_bytes(b) }) as f32
                })
                .collect::<Vec<f32>>()
        }};
    }
    let decoded = match datatype {
        DT_UINT8 => (decode!(u8, 1), true),
        DT_INT8 => (decode!(i8, 1), true),
        DT_INT16 => (decode!(i16, 2), true),
        DT_UINT16 => (decode!(u16, 2), true),
        DT_INT32 => (decode!(i32, 4), true),
        DT_UINT32 => (decode!(u32, 4), true),
        DT_FLOAT32 => (decode!(f32, 4), false),
        DT_FLOAT64 => (decode!(f64, 8), false),
        other => return Err(NodeError::NiftiError(format!("unsupported datatype code {}", other))),
    };
    Ok(decoded)
}

// Stored order has x fastest; reorder to row-major `[x, y, z]`.
fn to_row_major(stored: &[f32], spatial: &[usize]) -> Vec<f32> {
    let mut out = vec![0.0f32; stored.len()];
    let strides_out: Vec<usize> = (0..spatial.len())
        .map(|i| spatial[i + 1..].iter().product())
        .collect();
    let mut idx = vec![0usize; spatial.len()];
    for &v in stored {
        let pos: usize = idx.iter().zip(&strides_out).map(|(i, s)| i * s).sum();
        out[pos] = v;
        for (axis, i) in idx.iter_mut().enumerate() {
            *i += 1;
            if *i < spatial[axis] {
                break;
            }
            *i = 0;
        }
    }
    out
}

fn to_stored(row_major: &[f32], spatial: &[usize]) -> Vec<f32> {
    let strides: Vec<usize> = (0..spatial.len())
        .map(|i| spatial[i + 1..].iter().product())
        .collect();
    let mut out = Vec::with_capacity(row_major.len());
    let mut idx = vec![0usize; spatial.len()];
    for _ in 0..row_major.len() {
        let pos: usize = idx.iter().zip(&strides).map(|(i, s)| i * s).sum();
        out.push(row_major[pos]);
        for (axis, i) in idx.iter_mut().enumerate() {
            *i += 1;
            if *i < spatial[axis] {
                break;
            }
            *i = 0;
        }
    }
    out
}

/// Reads a `.nii` or `.nii.gz` file. `num_dimensions` is the number of
/// spatial axes expected; one extra axis is read as channels.
pub fn read_nifti(path: &Path, num_dimensions: usize) -> NodeResult<Volume> {
    let bytes = read_bytes(path)?;
    let fail = |msg: String| NodeError::NiftiError(format!("{}: {}", path.display(), msg));
    if bytes.len() < HEADER_SIZE {
        return Err(fail(format!("file is {} bytes, shorter than a header", bytes.len())));
    }
    let mut size = [0u8; 4];
    size.copy_from_slice(&bytes[0..4]);
    let little = if i32::from_le_bytes(size) == HEADER_SIZE as i32 {
        true
    } else if i32::from_be_bytes(size) == HEADER_SIZE as i32 {
        false
    } else {
        return Err(fail("not a NIfTI-1 header".to_string()));
    };
    let header = Header {
        bytes: &bytes,
        little,
    };

    let ndim = header.i16_at(40);
    if !(1..=7).contains(&ndim) {
        return Err(fail(format!("invalid dim[0] = {}", ndim)));
    }
    let mut dims: Vec<usize> = (1..=ndim as usize)
        .map(|i| header.i16_at(40 + 2 * i).max(1) as usize)
        .collect();
    while dims.len() < num_dimensions {
        dims.push(1);
    }
    let extra: Vec<usize> = dims[num_dimensions..].iter().copied().filter(|&d| d > 1).collect();
    let spatial = dims[..num_dimensions].to_vec();
    let channels = match extra.as_slice() {
        [] => 1,
        [c] => *c,
        _ => return Err(fail(format!("{:?} has too many axes for {} spatial dims", dims, num_dimensions))),
    };

    let datatype = header.i16_at(70);
    let offset = header.f32_at(108).max(HEADER_SIZE as f32) as usize;
    let slope = header.f32_at(112);
    let inter = header.f32_at(116);
    let plane: usize = spatial.iter().product();
    let body = bytes.get(offset..).ok_or_else(|| fail(format!("vox_offset {} past end of file", offset)))?;
    let (mut values, mut integer) = decode_voxels(body, datatype, little, plane * channels).map_err(|e| match e {
        NodeError::NiftiError(m) => fail(m),
        other => other,
    })?;
    if slope != 0.0 && slope.is_finite() && !(slope == 1.0 && inter == 0.0) {
        values.iter_mut().for_each(|v| *v = *v * slope + inter);
        integer = false;
    }

    let mut data = Vec::with_capacity(values.len());
    for c in 0..channels {
        data.extend(to_row_major(&values[c * plane..(c + 1) * plane], &spatial));
    }
    let mut sample_dims = vec![channels];
    sample_dims.extend_from_slice(&spatial);
    Ok(Volume {
        sample: Tensor::from_vec(&sample_dims, data)?,
        integer,
    })
}

/// Writes a channel-first sample `[C, S...]` as float32 NIfTI-1. More than
/// one channel is stored as a fourth axis. `.gz` paths are compressed.
pub fn write_nifti(path: &Path, sample: &Tensor) -> NodeResult<()> {
    let dims = sample.dims();
    if dims.len() < 2 || dims.len() > 4 {
        return Err(NodeError::shape_error("[C, S...] with 1-3 spatial dims", &sample.shape().to_string(), None));
    }
    let channels = dims[0];
    let spatial = &dims[1..];
    let mut shape: Vec<usize> = spatial.to_vec();
    if channels > 1 {
        while shape.len() < 3 {
            shape.push(1);
        }
        shape.push(channels);
    }
    if shape.iter().any(|&d| d > i16::MAX as usize) {
        return Err(NodeError::NiftiError(format!("dims {:?} exceed the NIfTI-1 range", shape)));
    }

    let mut header = vec![0u8; DATA_OFFSET];
    header[0..4].copy_from_slice(&(HEADER_SIZE as i32).to_le_bytes());
    header[40..42].copy_from_slice(&(shape.len() as i16).to_le_bytes());
    for i in 1..8 {
        let d = shape.get(i - 1).copied().unwrap_or(1) as i16;
        header[40 + 2 * i..42 + 2 * i].copy_from_slice(&d.to_le_bytes());
    }
    header[70..72].copy_from_slice(&DT_FLOAT32.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());
    for i in 0..8 {
        header[76 + 4 * i..80 + 4 * i].copy_from_slice(&1.0f32.to_le_bytes());
    }
    header[108..112].copy_from_slice(&(DATA_OFFSET as f32).to_le_bytes());
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[344..348].copy_from_slice(b"n+1\0");

    let plane: usize = spatial.iter().product();
    let mut body = header;
    body.reserve(sample.numel() * 4);
    for c in 0..channels {
        for v in to_stored(&sample.data()[c * plane..(c + 1) * plane], spatial) {
            body.extend_from_slice(&v.to_le_bytes());
        }
    }

    let file = File::create(path)?;
    if is_gzip(path) {
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(&body)?;
        encoder.finish()?;
    } else {
        let mut file = file;
        file.write_all(&body)?;
    }
    Ok(())
}

/// Every numeric cell of a CSV file in reading order. Cells that do not
/// parse as numbers (headers, labels) are skipped.
pub fn read_csv_values(path: &Path) -> NodeResult<Vec<f32>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .flat_map(|line| line.split(','))
        .filter_map(|cell| cell.trim().trim_matches('"').parse::<f32>().ok())
        .collect())
}
