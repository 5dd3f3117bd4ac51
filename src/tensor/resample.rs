//! Separable spatial resampling with an exact adjoint.
//!
//! Every spatial axis is resampled independently. Linear interpolation uses
//! half-pixel centres (`align_corners = false`); `avg` and `max` are adaptive
//! pools whose windows are `[floor(o*in/out), ceil((o+1)*in/out))`.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::core::{spatial3, Tensor};
use crate::error::{NodeError, NodeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    #[default]
    #[serde(alias = "trilinear", alias = "bilinear")]
    Linear,
    Nearest,
    Max,
    Avg,
}

#[derive(Debug, Clone)]
enum AxisPlan {
    Identity,
    Weighted(Vec<Vec<(usize, f32)>>),
    Max(Vec<(usize, usize)>),
}

fn pool_window(o: usize, in_len: usize, out_len: usize) -> (usize, usize) {
    let start = o * in_len / out_len;
    let end = ((o + 1) * in_len + out_len - 1) / out_len;
    (start, end.max(start + 1).min(in_len))
}

fn plan_axis(mode: Interpolation, in_len: usize, out_len: usize) -> AxisPlan {
    if in_len == out_len {
        return AxisPlan::Identity;
    }
    let scale = in_len as f64 / out_len as f64;
    match mode {
        Interpolation::Linear => AxisPlan::Weighted(
            (0..out_len)
                .map(|o| {
                    let src = ((o as f64 + 0.5) * scale - 0.5).max(0.0);
                    let i0 = (src.floor() as usize).min(in_len - 1);
                    let i1 = (i0 + 1).min(in_len - 1);
                    let l1 = (src - i0 as f64) as f32;
                    if i0 == i1 {
                        vec![(i0, 1.0)]
                    } else {
                        vec![(i0, 1.0 - l1), (i1, l1)]
                    }
                })
                .collect(),
        ),
        Interpolation::Nearest => AxisPlan::Weighted(
            (0..out_len)
                .map(|o| {
                    let src = ((o as f64 * scale).floor() as usize).min(in_len - 1);
                    vec![(src, 1.0)]
                })
                .collect(),
        ),
        Interpolation::Avg => AxisPlan::Weighted(
            (0..out_len)
                .map(|o| {
                    let (start, end) = pool_window(o, in_len, out_len);
                    let w = 1.0 / (end - start) as f32;
                    (start..end).map(|i| (i, w)).collect()
                })
                .collect(),
        ),
        Interpolation::Max => AxisPlan::Max((0..out_len).map(|o| pool_window(o, in_len, out_len)).collect()),
    }
}

#[derive(Debug, Clone)]
struct Stage {
    outer: usize,
    len: usize,
    inner: usize,
    out_len: usize,
    plan: AxisPlan,
    // flat input index chosen by each max-pooled output
    argmax: Vec<usize>,
}

impl Stage {
    fn forward(&mut self, input: &[f32]) -> Vec<f32> {
        let (len, inner, out_len) = (self.len, self.inner, self.out_len);
        let chunk_in = len * inner;
        let chunk_out = out_len * inner;
        let mut out = vec![0.0f32; self.outer * chunk_out];
        match &self.plan {
            AxisPlan::Identity => out.copy_from_slice(input),
            AxisPlan::Weighted(weights) => {
                out.par_chunks_mut(chunk_out).enumerate().for_each(|(o, dst)| {
                    let src = &input[o * chunk_in..(o + 1) * chunk_in];
                    for (j, taps) in weights.iter().enumerate() {
                        let row = &mut dst[j * inner..(j + 1) * inner];
                        for &(i, w) in taps {
                            let from = &src[i * inner..(i + 1) * inner];
                            for (d, s) in row.iter_mut().zip(from) {
                                *d += w * s;
                            }
                        }
                    }
                });
            }
            AxisPlan::Max(windows) => {
                let mut argmax = vec![0usize; out.len()];
                out.par_chunks_mut(chunk_out)
                    .zip(argmax.par_chunks_mut(chunk_out))
                    .enumerate()
                    .for_each(|(o, (dst, arg))| {
                        let base = o * chunk_in;
                        for (j, &(start, end)) in windows.iter().enumerate() {
                            for k in 0..inner {
                                let mut best = base + start * inner + k;
                                for i in start + 1..end {
                                    let idx = base + i * inner + k;
                                    if input[idx] > input[best] {
                                        best = idx;
                                    }
                                }
                                dst[j * inner + k] = input[best];
                                arg[j * inner + k] = best;
                            }
                        }
                    });
                self.argmax = argmax;
            }
        }
        out
    }

    fn backward(&self, grad: &[f32]) -> Vec<f32> {
        let (len, inner, out_len) = (self.len, self.inner, self.out_len);
        let chunk_in = len * inner;
        let chunk_out = out_len * inner;
        let mut grad_in = vec![0.0f32; self.outer * chunk_in];
        match &self.plan {
            AxisPlan::Identity => grad_in.copy_from_slice(grad),
            AxisPlan::Weighted(weights) => {
                grad_in.par_chunks_mut(chunk_in).enumerate().for_each(|(o, dst)| {
                    let src = &grad[o * chunk_out..(o + 1) * chunk_out];
                    for (j, taps) in weights.iter().enumerate() {
                        let row = &src[j * inner..(j + 1) * inner];
                        for &(i, w) in taps {
                            let to = &mut dst[i * inner..(i + 1) * inner];
                            for (d, g) in to.iter_mut().zip(row) {
                                *d += w * g;
                            }
                        }
                    }
                });
            }
            AxisPlan::Max(_) => {
                for (g, &idx) in grad.iter().zip(&self.argmax) {
                    grad_in[idx] += g;
                }
            }
        }
        grad_in
    }
}

/// State recorded by [`resample`] for the backward pass.
#[derive(Debug, Clone)]
pub struct ResampleCache {
    input_dims: Vec<usize>,
    output_dims: Vec<usize>,
    stages: Vec<Stage>,
}

impl ResampleCache {
    pub fn backward(&self, grad: &Tensor) -> NodeResult<Tensor> {
        if grad.dims() != self.output_dims.as_slice() {
            return Err(NodeError::shape_error(
                &format!("{:?}", self.output_dims),
                &grad.shape().to_string(),
                Some("gradient must match the resampled output"),
            ));
        }
        let mut buffer = grad.data().to_vec();
        for stage in self.stages.iter().rev() {
            buffer = stage.backward(&buffer);
        }
        Tensor::from_vec(&self.input_dims, buffer)
    }
}

/// Resamples the spatial dims of a batched tensor `[N, C, S...]`.
pub fn resample(input: &Tensor, out_spatial: &[usize], mode: Interpolation) -> NodeResult<(Tensor, ResampleCache)> {
    let shape = input.shape();
    if shape.ndim() < 2 || shape.spatial().len() != out_spatial.len() {
        return Err(NodeError::shape_error(
            &format!("[N, C] followed by {} spatial dims", out_spatial.len()),
            &shape.to_string(),
            None,
        ));
    }
    if out_spatial.iter().any(|&d| d == 0) || shape.spatial().iter().any(|&d| d == 0) {
        return Err(NodeError::operation_error("resample", "spatial dims must be non-zero"));
    }

    let nc = shape.batch() * shape.channels();
    let src = spatial3(shape.spatial())?;
    let dst = spatial3(out_spatial)?;
    let mut current = src;
    let mut buffer = input.data().to_vec();
    let mut stages = Vec::with_capacity(3);
    for axis in 0..3 {
        let outer = nc * current[..axis].iter().product::<usize>();
        let inner: usize = current[axis + 1..].iter().product();
        let mut stage = Stage {
            outer,
            len: current[axis],
            inner,
            out_len: dst[axis],
            plan: plan_axis(mode, current[axis], dst[axis]),
            argmax: Vec::new(),
        };
        buffer = stage.forward(&buffer);
        current[axis] = dst[axis];
        stages.push(stage);
    }

    let mut dims = vec![shape.batch(), shape.channels()];
    dims.extend_from_slice(out_spatial);
    let output = Tensor::from_vec(&dims, buffer)?;
    let cache = ResampleCache {
        input_dims: shape.dims.clone(),
        output_dims: dims,
        stages,
    };
    Ok((output, cache))
}

pub fn resize(input: &Tensor, out_spatial: &[usize], mode: Interpolation) -> NodeResult<Tensor> {
    if input.shape().spatial() == out_spatial {
        return Ok(input.clone());
    }
    resample(input, out_spatial, mode).map(|(out, _)| out)
}

/// Resizes a single sample `[C, S...]`.
pub fn resize_sample(sample: &Tensor, out_spatial: &[usize], mode: Interpolation) -> NodeResult<Tensor> {
    let mut dims = vec![1];
    dims.extend_from_slice(sample.dims());
    let batched = sample.clone().reshape(&dims)?;
    let resized = resize(&batched, out_spatial, mode)?;
    let out_dims = resized.dims()[1..].to_vec();
    resized.reshape(&out_dims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp(dims: &[usize]) -> Tensor {
        let n: usize = dims.iter().product();
        Tensor::from_vec(dims, (0..n).map(|i| (i as f32 * 0.37).sin()).collect()).unwrap()
    }

    #[test]
    fn test_linear_upsample_matches_half_pixel_rule() {
        let x = Tensor::from_vec(&[1, 1, 2], vec![0.0, 1.0]).unwrap();
        let y = resize(&x, &[4], Interpolation::Linear).unwrap();
        let expected = [0.0, 0.25, 0.75, 1.0];
        for (a, b) in y.data().iter().zip(expected) {
            assert_relative_eq!(*a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_adaptive_pools() {
        let x = Tensor::from_vec(&[1, 1, 4], vec![1.0, 3.0, 2.0, 8.0]).unwrap();
        let avg = resize(&x, &[2], Interpolation::Avg).unwrap();
        assert_eq!(avg.data(), &[2.0, 5.0]);
        let max = resize(&x, &[2], Interpolation::Max).unwrap();
        assert_eq!(max.data(), &[3.0, 8.0]);
        let nearest = resize(&x, &[2], Interpolation::Nearest).unwrap();
        assert_eq!(nearest.data(), &[1.0, 2.0]);
    }

    #[test]
    fn test_identity_when_sizes_match() {
        let x = ramp(&[2, 3, 4, 5]);
        let (y, cache) = resample(&x, &[4, 5], Interpolation::Linear).unwrap();
        assert_eq!(y, x);
        assert_eq!(cache.backward(&x).unwrap(), x);
    }

    #[test]
    fn test_rejects_dim_mismatch() {
        let x = ramp(&[1, 1, 4, 4]);
        assert!(resample(&x, &[4], Interpolation::Linear).is_err());
        assert!(resample(&x, &[0, 4], Interpolation::Linear).is_err());
    }

    #[test]
    fn test_backward_is_adjoint() {
        // <R x, g> == <x, R^T g> for every linear mode
        for mode in [Interpolation::Linear, Interpolation::Nearest, Interpolation::Avg] {
            let x = ramp(&[2, 2, 3, 5, 4]);
            let (y, cache) = resample(&x, &[4, 3, 6], mode).unwrap();
            let g = ramp(y.dims()).map(|v| v + 0.3);
            let back = cache.backward(&g).unwrap();
            let lhs: f32 = y.data().iter().zip(g.data()).map(|(a, b)| a * b).sum();
            let rhs: f32 = x.data().iter().zip(back.data()).map(|(a, b)| a * b).sum();
            assert_relative_eq!(lhs, rhs, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_max_backward_routes_to_winner() {
        let x = Tensor::from_vec(&[1, 1, 2, 2], vec![1.0, 5.0, 2.0, 0.0]).unwrap();
        let (y, cache) = resample(&x, &[1, 1], Interpolation::Max).unwrap();
        assert_eq!(y.data(), &[5.0]);
        let g = Tensor::from_vec(&[1, 1, 1, 1], vec![2.0]).unwrap();
        assert_eq!(cache.backward(&g).unwrap().data(), &[0.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_resize_sample_keeps_channel_first_layout() {
        let s = ramp(&[2, 4, 4]);
        let r = resize_sample(&s, &[2, 2], Interpolation::Avg).unwrap();
        assert_eq!(r.dims(), &[2, 2, 2]);
    }

    #[test]
    fn test_interpolation_names() {
        let m: Interpolation = serde_json::from_str("\"trilinear\"").unwrap();
        assert_eq!(m, Interpolation::Linear);
        let m: Interpolation = serde_json::from_str("\"max\"").unwrap();
        assert_eq!(m, Interpolation::Max);
    }
}
