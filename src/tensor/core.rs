//! Core tensor types and fundamental operations

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};

/// Runtime shape. Batched tensors are laid out `[N, C, S...]`, single
/// samples `[C, S...]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Self { dims: dims.to_vec() }
    }

    pub fn total_elements(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.dims
    }

    pub fn batch(&self) -> usize {
        self.dims.first().copied().unwrap_or(1)
    }

    pub fn channels(&self) -> usize {
        self.dims.get(1).copied().unwrap_or(1)
    }

    /// Spatial extent of a batched shape.
    pub fn spatial(&self) -> &[usize] {
        if self.dims.len() > 2 {
            &self.dims[2..]
        } else {
            &[]
        }
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}]",
            self.dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
        )
    }
}

/// Pads spatial dims to three with leading ones: `[h, w]` becomes `[1, h, w]`.
pub fn spatial3(spatial: &[usize]) -> NodeResult<[usize; 3]> {
    if spatial.len() > 3 {
        return Err(NodeError::shape_error(
            "at most 3 spatial dimensions",
            &format!("{}", spatial.len()),
            None,
        ));
    }
    let mut out = [1usize; 3];
    let offset = 3 - spatial.len();
    for (i, &d) in spatial.iter().enumerate() {
        out[offset + i] = d;
    }
    Ok(out)
}

/// Dense row-major `f32` tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Shape,
    data: Vec<f32>,
}

impl Tensor {
    pub fn zeros(dims: &[usize]) -> Self {
        Self::full(dims, 0.0)
    }

    pub fn full(dims: &[usize], value: f32) -> Self {
        let shape = Shape::new(dims);
        let data = vec![value; shape.total_elements()];
        Self { shape, data }
    }

    pub fn from_vec(dims: &[usize], data: Vec<f32>) -> NodeResult<Self> {
        let shape = Shape::new(dims);
        if shape.total_elements() != data.len() {
            return Err(NodeError::shape_error(
                &format!("{} elements for shape {}", shape.total_elements(), shape),
                &format!("{} elements", data.len()),
                None,
            ));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        &self.shape.dims
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn reshape(self, dims: &[usize]) -> NodeResult<Self> {
        Self::from_vec(dims, self.data)
    }

    pub fn map<F: Fn(f32) -> f32>(&self, f: F) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    pub fn zip_map<F: Fn(f32, f32) -> f32>(&self, other: &Tensor, f: F) -> NodeResult<Self> {
        self.expect_same_shape(other, "zip_map")?;
        Ok(Self {
            shape: self.shape.clone(),
            data: self.data.iter().zip(&other.data).map(|(&a, &b)| f(a, b)).collect(),
        })
    }

    pub fn add_assign(&mut self, other: &Tensor) -> NodeResult<()> {
        self.expect_same_shape(other, "add_assign")?;
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
        Ok(())
    }

    pub fn add_scaled(&mut self, other: &Tensor, scale: f32) -> NodeResult<()> {
        self.expect_same_shape(other, "add_scaled")?;
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += scale * b;
        }
        Ok(())
    }

    pub fn scale(&self, factor: f32) -> Self {
        self.map(|v| v * factor)
    }

    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            0.0
        } else {
            self.sum() / self.data.len() as f32
        }
    }

    pub fn expect_same_shape(&self, other: &Tensor, operation: &str) -> NodeResult<()> {
        if self.shape != other.shape {
            return Err(NodeError::shape_error(
                &self.shape.to_string(),
                &other.shape.to_string(),
                Some(&format!("both operands of {} must have the same shape", operation)),
            ));
        }
        Ok(())
    }

    /// Elements per (sample, channel) plane of a batched tensor.
    pub fn plane_len(&self) -> usize {
        self.shape.spatial().iter().product()
    }

    /// Concatenates batched tensors along the channel axis.
    pub fn concat_channels(parts: &[&Tensor]) -> NodeResult<Tensor> {
        let first = parts
            .first()
            .ok_or_else(|| NodeError::operation_error("concat_channels", "no tensors to concatenate"))?;
        let n = first.shape.batch();
        let spatial = first.shape.spatial().to_vec();
        for part in parts {
            if part.shape.ndim() < 2 || part.shape.batch() != n || part.shape.spatial() != spatial.as_slice() {
                return Err(NodeError::shape_error(
                    &format!("[{}, *, {:?}]", n, spatial),
                    &part.shape.to_string(),
                    Some("resample sources to a common feature size before concatenation"),
                ));
            }
        }
        let plane: usize = spatial.iter().product();
        let channels: usize = parts.iter().map(|p| p.shape.channels()).sum();
        let mut data = Vec::with_capacity(n * channels * plane);
        for b in 0..n {
            for part in parts {
                let c = part.shape.channels();
                let start = b * c * plane;
                data.extend_from_slice(&part.data[start..start + c * plane]);
            }
        }
        let mut dims = vec![n, channels];
        dims.extend_from_slice(&spatial);
        Tensor::from_vec(&dims, data)
    }

    /// Splits a batched tensor into consecutive channel groups.
    pub fn split_channels(&self, sizes: &[usize]) -> NodeResult<Vec<Tensor>> {
        let channels = self.shape.channels();
        if sizes.iter().sum::<usize>() != channels {
            return Err(NodeError::shape_error(
                &format!("{} channels", sizes.iter().sum::<usize>()),
                &format!("{} channels", channels),
                None,
            ));
        }
        let n = self.shape.batch();
        let plane = self.plane_len();
        let spatial = self.shape.spatial().to_vec();
        let mut out = Vec::with_capacity(sizes.len());
        let mut offset = 0;
        for &size in sizes {
            let mut data = Vec::with_capacity(n * size * plane);
            for b in 0..n {
                let start = (b * channels + offset) * plane;
                data.extend_from_slice(&self.data[start..start + size * plane]);
            }
            let mut dims = vec![n, size];
            dims.extend_from_slice(&spatial);
            out.push(Tensor::from_vec(&dims, data)?);
            offset += size;
        }
        Ok(out)
    }

    /// Stacks per-sample tensors `[C, S...]` into a batch `[N, C, S...]`.
    pub fn stack(samples: &[Tensor]) -> NodeResult<Tensor> {
        let first = samples
            .first()
            .ok_or_else(|| NodeError::operation_error("stack", "no samples to stack"))?;
        let mut data = Vec::with_capacity(first.numel() * samples.len());
        for sample in samples {
            first.expect_same_shape(sample, "stack")?;
            data.extend_from_slice(&sample.data);
        }
        let mut dims = vec![samples.len()];
        dims.extend_from_slice(first.dims());
        Tensor::from_vec(&dims, data)
    }

    /// Concatenates batched tensors along the batch axis.
    pub fn concat_batch(parts: &[Tensor]) -> NodeResult<Tensor> {
        let first = parts
            .first()
            .ok_or_else(|| NodeError::operation_error("concat_batch", "no tensors to concatenate"))?;
        let rest = &first.dims()[1..];
        let mut data = Vec::new();
        let mut n = 0;
        for part in parts {
            if &part.dims()[1..] != rest {
                return Err(NodeError::shape_error(
                    &format!("[*, {:?}]", rest),
                    &part.shape.to_string(),
                    None,
                ));
            }
            n += part.shape.batch();
            data.extend_from_slice(&part.data);
        }
        let mut dims = vec![n];
        dims.extend_from_slice(rest);
        Tensor::from_vec(&dims, data)
    }

    /// Per-voxel class labels of a batched tensor, `N * plane` entries in
    /// `[n, s]` order. A single channel is thresholded into classes 0 and 1.
    pub fn argmax_channels(&self, threshold: f32) -> Vec<usize> {
        self.channel_labels(Some(threshold))
    }

    /// Index of the largest channel per voxel. A single channel is always
    /// class 0.
    pub fn argmax(&self) -> Vec<usize> {
        self.channel_labels(None)
    }

    fn channel_labels(&self, threshold: Option<f32>) -> Vec<usize> {
        let n = self.shape.batch();
        let c = self.shape.channels();
        let plane = self.plane_len();
        let mut labels = Vec::with_capacity(n * plane);
        for b in 0..n {
            let base = b * c * plane;
            for s in 0..plane {
                if let (1, Some(threshold)) = (c, threshold) {
                    labels.push(usize::from(self.data[base + s] > threshold));
                    continue;
                }
                let mut best = 0;
                let mut best_value = f32::NEG_INFINITY;
                for ch in 0..c {
                    let v = self.data[base + ch * plane + s];
                    if v > best_value {
                        best_value = v;
                        best = ch;
                    }
                }
                labels.push(best);
            }
        }
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(n: usize, c: usize, s: usize, offset: f32) -> Tensor {
        let data = (0..n * c * s).map(|i| i as f32 + offset).collect();
        Tensor::from_vec(&[n, c, s], data).unwrap()
    }

    #[test]
    fn test_shape_display_and_accessors() {
        let shape = Shape::new(&[2, 3, 4, 5]);
        assert_eq!(shape.to_string(), "[2, 3, 4, 5]");
        assert_eq!(shape.batch(), 2);
        assert_eq!(shape.channels(), 3);
        assert_eq!(shape.spatial(), &[4, 5]);
        assert_eq!(shape.total_elements(), 120);
    }

    #[test]
    fn test_spatial3_pads_leading_axes() {
        assert_eq!(spatial3(&[7]).unwrap(), [1, 1, 7]);
        assert_eq!(spatial3(&[4, 5]).unwrap(), [1, 4, 5]);
        assert_eq!(spatial3(&[]).unwrap(), [1, 1, 1]);
        assert!(spatial3(&[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn test_from_vec_rejects_wrong_length() {
        let err = Tensor::from_vec(&[2, 2], vec![1.0; 3]).unwrap_err();
        assert!(matches!(err, NodeError::ShapeError(_)));
    }

    #[test]
    fn test_concat_then_split_channels() {
        let a = batch(2, 1, 3, 0.0);
        let b = batch(2, 2, 3, 100.0);
        let joined = Tensor::concat_channels(&[&a, &b]).unwrap();
        assert_eq!(joined.dims(), &[2, 3, 3]);
        // second sample starts with a's second plane
        assert_eq!(&joined.data()[9..12], &a.data()[3..6]);

        let parts = joined.split_channels(&[1, 2]).unwrap();
        assert_eq!(parts[0], a);
        assert_eq!(parts[1], b);
        assert!(joined.split_channels(&[1, 1]).is_err());
    }

    #[test]
    fn test_concat_channels_requires_matching_spatial() {
        let a = batch(1, 1, 3, 0.0);
        let b = batch(1, 1, 4, 0.0);
        assert!(Tensor::concat_channels(&[&a, &b]).is_err());
    }

    #[test]
    fn test_stack_and_concat_batch() {
        let s = Tensor::from_vec(&[1, 2], vec![1.0, 2.0]).unwrap();
        let stacked = Tensor::stack(&[s.clone(), s.clone()]).unwrap();
        assert_eq!(stacked.dims(), &[2, 1, 2]);
        let both = Tensor::concat_batch(&[stacked.clone(), stacked]).unwrap();
        assert_eq!(both.dims(), &[4, 1, 2]);
        assert_eq!(both.sum(), 12.0);
    }

    #[test]
    fn test_argmax_channels() {
        let t = Tensor::from_vec(&[1, 2, 2], vec![0.9, 0.1, 0.1, 0.8]).unwrap();
        assert_eq!(t.argmax_channels(0.5), vec![0, 1]);

        let single = Tensor::from_vec(&[1, 1, 3], vec![0.2, 0.6, 0.5]).unwrap();
        assert_eq!(single.argmax_channels(0.5), vec![0, 1, 0]);
    }

    #[test]
    fn test_argmax_without_threshold() {
        let t = Tensor::from_vec(&[2, 2, 1], vec![0.9, 0.1, 0.2, 0.8]).unwrap();
        assert_eq!(t.argmax(), vec![0, 1]);

        let single = Tensor::from_vec(&[1, 1, 4], vec![0.9, 0.1, 0.9, 0.1]).unwrap();
        assert_eq!(single.argmax(), vec![0; 4]);
    }
}
