//! Neural network layers with explicit forward caches and backward passes.

use std::collections::BTreeMap;

use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};
use crate::tensor::{spatial3, Tensor};

/// Trainable tensor with its accumulated gradient.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub value: Tensor,
    pub grad: Tensor,
    pub trainable: bool,
}

impl Parameter {
    pub fn new(value: Tensor, trainable: bool) -> Self {
        let grad = Tensor::zeros(value.dims());
        Self { value, grad, trainable }
    }

    pub fn zero_grad(&mut self) {
        self.grad.data_mut().iter_mut().for_each(|g| *g = 0.0);
    }

    fn accumulate(&mut self, grad: &[f32]) {
        if !self.trainable {
            return;
        }
        for (g, d) in self.grad.data_mut().iter_mut().zip(grad) {
            *g += d;
        }
    }
}

/// Named tensors of a module: parameters plus running statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub tensors: BTreeMap<String, Tensor>,
}

pub(crate) fn join_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Anything holding parameters or buffers.
pub trait Module {
    fn visit_parameters(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Parameter));

    fn visit_buffers(&mut self, _prefix: &str, _f: &mut dyn FnMut(&str, &mut Tensor)) {}

    fn set_training(&mut self, _training: bool) {}

    fn zero_grad(&mut self) {
        self.visit_parameters("", &mut |_, p| p.zero_grad());
    }

    fn num_parameters(&mut self) -> usize {
        let mut total = 0;
        self.visit_parameters("", &mut |_, p| total += p.value.numel());
        total
    }

    fn state_dict(&mut self) -> ModelState {
        let mut state = ModelState::default();
        self.visit_parameters("", &mut |name, p| {
            state.tensors.insert(name.to_string(), p.value.clone());
        });
        self.visit_buffers("", &mut |name, t| {
            state.tensors.insert(name.to_string(), t.clone());
        });
        state
    }

    /// Copies matching tensors from `state`. With `strict`, every tensor of
    /// the module must be present. Returns the number of tensors loaded.
    fn load_state_dict(&mut self, state: &ModelState, strict: bool) -> NodeResult<usize> {
        let mut loaded = 0;
        let mut errors = Vec::new();
        let mut copy = |name: &str, target: &mut Tensor| match state.tensors.get(name) {
            Some(source) if source.dims() == target.dims() => {
                target.data_mut().copy_from_slice(source.data());
                loaded += 1;
            }
            Some(source) => errors.push(format!(
                "{}: expected {}, found {}",
                name,
                target.shape(),
                source.shape()
            )),
            None if strict => errors.push(format!("{}: missing", name)),
            None => {}
        };
        self.visit_parameters("", &mut |name, p| copy(name, &mut p.value));
        self.visit_buffers("", &mut |name, t| copy(name, t));
        if !errors.is_empty() {
            return Err(NodeError::InvalidData(format!("cannot load state: {}", errors.join("; "))));
        }
        Ok(loaded)
    }
}

// Output positions `o` for which `o + offset` lies in `[0, len)`.
fn valid_range(len: usize, offset: isize) -> (usize, usize) {
    let start = (-offset).max(0) as usize;
    let end = (len as isize - offset).clamp(0, len as isize) as usize;
    (start.min(end), end)
}

/// Stride-1 convolution over 1 to 3 spatial dims with "same" zero padding.
#[derive(Debug, Clone)]
pub struct Conv {
    pub weight: Parameter,
    pub bias: Parameter,
    kernel: [usize; 3],
    input: Option<Tensor>,
}

impl Conv {
    /// `weight` is `[out, in, k...]` with one odd kernel size per spatial dim.
    pub fn new(weight: Tensor, trainable: bool) -> NodeResult<Self> {
        let dims = weight.dims().to_vec();
        if dims.len() < 3 || dims.len() > 5 {
            return Err(NodeError::shape_error(
                "[out, in, k...] with 1 to 3 kernel dims",
                &weight.shape().to_string(),
                None,
            ));
        }
        if dims[2..].iter().any(|&k| k % 2 == 0) {
            return Err(NodeError::shape_error(
                "odd kernel sizes",
                &weight.shape().to_string(),
                Some("same padding needs an odd kernel"),
            ));
        }
        let kernel = spatial3(&dims[2..])?;
        let bias = Parameter::new(Tensor::zeros(&[dims[0]]), trainable);
        Ok(Self {
            weight: Parameter::new(weight, trainable),
            bias,
            kernel,
            input: None,
        })
    }

    /// Kaiming-uniform weights with bound `1/sqrt(fan_in)`.
    pub fn kaiming_uniform(shape: &[usize], rng: &mut StdRng) -> NodeResult<Tensor> {
        let fan_in: usize = shape.iter().skip(1).product();
        let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
        let numel: usize = shape.iter().product();
        let data = (0..numel).map(|_| rng.gen_range(-bound..=bound)).collect();
        Tensor::from_vec(shape, data)
    }

    /// `[c, c, 1...]` weights that copy every channel unchanged.
    pub fn identity_weight(channels: usize, spatial_dims: usize) -> NodeResult<Tensor> {
        let mut dims = vec![channels, channels];
        dims.extend(std::iter::repeat(1).take(spatial_dims));
        let mut data = vec![0.0; channels * channels];
        for c in 0..channels {
            data[c * channels + c] = 1.0;
        }
        Tensor::from_vec(&dims, data)
    }

    pub fn in_channels(&self) -> usize {
        self.weight.value.dims()[1]
    }

    pub fn out_channels(&self) -> usize {
        self.weight.value.dims()[0]
    }

    pub fn spatial_dims(&self) -> usize {
        self.weight.value.dims().len() - 2
    }

    fn check_input(&self, input: &Tensor) -> NodeResult<[usize; 3]> {
        let shape = input.shape();
        if shape.ndim() != self.spatial_dims() + 2 || shape.channels() != self.in_channels() {
            return Err(NodeError::shape_error(
                &format!("[N, {}] with {} spatial dims", self.in_channels(), self.spatial_dims()),
                &shape.to_string(),
                None,
            ));
        }
        if input.numel() == 0 {
            return Err(NodeError::operation_error("conv", "empty input"));
        }
        spatial3(shape.spatial())
    }

    fn offsets(&self) -> Vec<(usize, [isize; 3])> {
        let [kd, kh, kw] = self.kernel;
        let mut out = Vec::with_capacity(kd * kh * kw);
        for a in 0..kd {
            for b in 0..kh {
                for c in 0..kw {
                    let idx = (a * kh + b) * kw + c;
                    out.push((
                        idx,
                        [
                            a as isize - (kd / 2) as isize,
                            b as isize - (kh / 2) as isize,
                            c as isize - (kw / 2) as isize,
                        ],
                    ));
                }
            }
        }
        out
    }

    pub fn forward(&mut self, input: &Tensor) -> NodeResult<Tensor> {
        let [d, h, w] = self.check_input(input)?;
        let plane = d * h * w;
        let (n, ci, co) = (input.shape().batch(), self.in_channels(), self.out_channels());
        let ksize = self.kernel.iter().product::<usize>();
        let offsets = self.offsets();
        let x = input.data();
        let weight = self.weight.value.data();
        let bias = self.bias.value.data();

        let mut out = vec![0.0f32; n * co * plane];
        out.par_chunks_mut(plane).enumerate().for_each(|(idx, dst)| {
            let (b, o) = (idx / co, idx % co);
            dst.iter_mut().for_each(|v| *v = bias[o]);
            for i in 0..ci {
                let src = &x[(b * ci + i) * plane..(b * ci + i + 1) * plane];
                let wbase = (o * ci + i) * ksize;
                for &(k, [oz, oy, ox]) in &offsets {
                    let wk = weight[wbase + k];
                    if wk == 0.0 {
                        continue;
                    }
                    let (z0, z1) = valid_range(d, oz);
                    let (y0, y1) = valid_range(h, oy);
                    let (x0, x1) = valid_range(w, ox);
                    for z in z0..z1 {
                        let zi = (z as isize + oz) as usize;
                        for y in y0..y1 {
                            let yi = (y as isize + oy) as usize;
                            let orow = (z * h + y) * w;
                            let irow = (zi * h + yi) * w;
                            for xx in x0..x1 {
                                dst[orow + xx] += wk * src[(irow as isize + xx as isize + ox) as usize];
                            }
                        }
                    }
                }
            }
        });

        self.input = Some(input.clone());
        let mut dims = vec![n, co];
        dims.extend_from_slice(input.shape().spatial());
        Tensor::from_vec(&dims, out)
    }

    pub fn backward(&mut self, grad_output: &Tensor) -> NodeResult<Tensor> {
        let input = self
            .input
            .take()
            .ok_or_else(|| NodeError::operation_error("conv_backward", "backward called before forward"))?;
        let [d, h, w] = spatial3(input.shape().spatial())?;
        let plane = d * h * w;
        let (n, ci, co) = (input.shape().batch(), self.in_channels(), self.out_channels());
        if grad_output.shape().batch() != n || grad_output.shape().channels() != co || grad_output.plane_len() != plane {
            return Err(NodeError::shape_error(
                &format!("[{}, {}, ...]", n, co),
                &grad_output.shape().to_string(),
                None,
            ));
        }
        let ksize = self.kernel.iter().product::<usize>();
        let offsets = self.offsets();
        let x = input.data();
        let g = grad_output.data();
        let weight = self.weight.value.data();

        let mut grad_input = vec![0.0f32; n * ci * plane];
        grad_input.par_chunks_mut(plane).enumerate().for_each(|(idx, dst)| {
            let (b, i) = (idx / ci, idx % ci);
            for o in 0..co {
                let gsrc = &g[(b * co + o) * plane..(b * co + o + 1) * plane];
                let wbase = (o * ci + i) * ksize;
                for &(k, [oz, oy, ox]) in &offsets {
                    let wk = weight[wbase + k];
                    if wk == 0.0 {
                        continue;
                    }
                    let (z0, z1) = valid_range(d, oz);
                    let (y0, y1) = valid_range(h, oy);
                    let (x0, x1) = valid_range(w, ox);
                    for z in z0..z1 {
                        let zi = (z as isize + oz) as usize;
                        for y in y0..y1 {
                            let yi = (y as isize + oy) as usize;
                            let orow = (z * h + y) * w;
                            let irow = (zi * h + yi) * w;
                            for xx in x0..x1 {
                                dst[(irow as isize + xx as isize + ox) as usize] += wk * gsrc[orow + xx];
                            }
                        }
                    }
                }
            }
        });

        if self.weight.trainable {
            let mut grad_weight = vec![0.0f32; co * ci * ksize];
            grad_weight.par_chunks_mut(ksize).enumerate().for_each(|(idx, dst)| {
                let (o, i) = (idx / ci, idx % ci);
                for b in 0..n {
                    let gsrc = &g[(b * co + o) * plane..(b * co + o + 1) * plane];
                    let src = &x[(b * ci + i) * plane..(b * ci + i + 1) * plane];
                    for &(k, [oz, oy, ox]) in &offsets {
                        let (z0, z1) = valid_range(d, oz);
                        let (y0, y1) = valid_range(h, oy);
                        let (x0, x1) = valid_range(w, ox);
                        let mut acc = 0.0f32;
                        for z in z0..z1 {
                            let zi = (z as isize + oz) as usize;
                            for y in y0..y1 {
                                let yi = (y as isize + oy) as usize;
                                let orow = (z * h + y) * w;
                                let irow = (zi * h + yi) * w;
                                for xx in x0..x1 {
                                    acc += gsrc[orow + xx] * src[(irow as isize + xx as isize + ox) as usize];
                                }
                            }
                        }
                        dst[k] += acc;
                    }
                }
            });
            self.weight.accumulate(&grad_weight);

            let mut grad_bias = vec![0.0f32; co];
            for b in 0..n {
                for (o, gb) in grad_bias.iter_mut().enumerate() {
                    *gb += g[(b * co + o) * plane..(b * co + o + 1) * plane].iter().sum::<f32>();
                }
            }
            self.bias.accumulate(&grad_bias);
        }

        Tensor::from_vec(input.dims(), grad_input)
    }
}

impl Module for Conv {
    fn visit_parameters(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Parameter)) {
        f(&join_name(prefix, "weight"), &mut self.weight);
        f(&join_name(prefix, "bias"), &mut self.bias);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormKind {
    Batch,
    Instance,
}

#[derive(Debug, Clone)]
struct NormCache {
    xhat: Vec<f32>,
    inv_std: Vec<f32>,
    batch_stats: bool,
}

/// Batch or instance normalization with an affine transform.
#[derive(Debug, Clone)]
pub struct Normalization {
    pub kind: NormKind,
    pub gamma: Parameter,
    pub beta: Parameter,
    pub running_mean: Tensor,
    pub running_var: Tensor,
    momentum: f32,
    eps: f32,
    training: bool,
    cache: Option<(Vec<usize>, NormCache)>,
}

impl Normalization {
    pub fn new(kind: NormKind, channels: usize) -> Self {
        Self {
            kind,
            gamma: Parameter::new(Tensor::full(&[channels], 1.0), true),
            beta: Parameter::new(Tensor::zeros(&[channels]), true),
            running_mean: Tensor::zeros(&[channels]),
            running_var: Tensor::full(&[channels], 1.0),
            momentum: 0.1,
            eps: 1e-5,
            training: true,
            cache: None,
        }
    }

    pub fn channels(&self) -> usize {
        self.gamma.value.numel()
    }

    // Flat indices of every element in one normalization group.
    fn groups(&self, n: usize, c: usize, plane: usize) -> Vec<Vec<std::ops::Range<usize>>> {
        match self.kind {
            NormKind::Batch => (0..c)
                .map(|ch| (0..n).map(|b| (b * c + ch) * plane..(b * c + ch + 1) * plane).collect())
                .collect(),
            NormKind::Instance => (0..n * c).map(|g| vec![g * plane..(g + 1) * plane]).collect(),
        }
    }

    pub fn forward(&mut self, input: &Tensor) -> NodeResult<Tensor> {
        let shape = input.shape();
        let (n, c, plane) = (shape.batch(), shape.channels(), input.plane_len());
        if c != self.channels() || shape.ndim() < 2 {
            return Err(NodeError::shape_error(
                &format!("[N, {}, ...]", self.channels()),
                &shape.to_string(),
                None,
            ));
        }
        let use_batch_stats = self.training || self.kind == NormKind::Instance;
        let x = input.data();
        let mut xhat = vec![0.0f32; x.len()];
        let groups = self.groups(n, c, plane);
        let mut inv_stds = Vec::with_capacity(groups.len());

        for (gi, ranges) in groups.iter().enumerate() {
            let ch = gi % c;
            let count: usize = ranges.iter().map(|r| r.len()).sum();
            let (mean, var) = if use_batch_stats {
                let mean = ranges.iter().flat_map(|r| x[r.clone()].iter()).sum::<f32>() / count as f32;
                let var = ranges
                    .iter()
                    .flat_map(|r| x[r.clone()].iter())
                    .map(|v| (v - mean).powi(2))
                    .sum::<f32>()
                    / count as f32;
                if self.training && self.kind == NormKind::Batch {
                    let unbiased = if count > 1 { var * count as f32 / (count - 1) as f32 } else { var };
                    let rm = &mut self.running_mean.data_mut()[ch];
                    *rm = (1.0 - self.momentum) * *rm + self.momentum * mean;
                    let rv = &mut self.running_var.data_mut()[ch];
                    *rv = (1.0 - self.momentum) * *rv + self.momentum * unbiased;
                }
                (mean, var)
            } else {
                (self.running_mean.data()[ch], self.running_var.data()[ch])
            };
            let inv_std = 1.0 / (var + self.eps).sqrt();
            for r in ranges {
                for idx in r.clone() {
                    xhat[idx] = (x[idx] - mean) * inv_std;
                }
            }
            inv_stds.push(inv_std);
        }

        let gamma = self.gamma.value.data();
        let beta = self.beta.value.data();
        let mut out = vec![0.0f32; x.len()];
        for (i, v) in out.iter_mut().enumerate() {
            let ch = (i / plane) % c;
            *v = gamma[ch] * xhat[i] + beta[ch];
        }
        self.cache = Some((
            input.dims().to_vec(),
            NormCache {
                xhat,
                inv_std: inv_stds,
                batch_stats: use_batch_stats,
            },
        ));
        Tensor::from_vec(input.dims(), out)
    }

    pub fn backward(&mut self, grad_output: &Tensor) -> NodeResult<Tensor> {
        let (dims, cache) = self
            .cache
            .take()
            .ok_or_else(|| NodeError::operation_error("norm_backward", "backward called before forward"))?;
        if grad_output.dims() != dims.as_slice() {
            return Err(NodeError::shape_error(&format!("{:?}", dims), &grad_output.shape().to_string(), None));
        }
        let (n, c) = (dims[0], dims[1]);
        let plane: usize = dims[2..].iter().product();
        let dy = grad_output.data();
        let gamma = self.gamma.value.data().to_vec();

        let mut grad_gamma = vec![0.0f32; c];
        let mut grad_beta = vec![0.0f32; c];
        for (i, &g) in dy.iter().enumerate() {
            let ch = (i / plane) % c;
            grad_gamma[ch] += g * cache.xhat[i];
            grad_beta[ch] += g;
        }

        let mut dx = vec![0.0f32; dy.len()];
        for (gi, ranges) in self.groups(n, c, plane).iter().enumerate() {
            let ch = gi % c;
            let inv_std = cache.inv_std[gi];
            if !cache.batch_stats {
                for r in ranges {
                    for idx in r.clone() {
                        dx[idx] = gamma[ch] * inv_std * dy[idx];
                    }
                }
                continue;
            }
            let m = ranges.iter().map(|r| r.len()).sum::<usize>() as f32;
            let mut sum_dxhat = 0.0f32;
            let mut sum_dxhat_xhat = 0.0f32;
            for r in ranges {
                for idx in r.clone() {
                    let dxhat = dy[idx] * gamma[ch];
                    sum_dxhat += dxhat;
                    sum_dxhat_xhat += dxhat * cache.xhat[idx];
                }
            }
            for r in ranges {
                for idx in r.clone() {
                    let dxhat = dy[idx] * gamma[ch];
                    dx[idx] = inv_std / m * (m * dxhat - sum_dxhat - cache.xhat[idx] * sum_dxhat_xhat);
                }
            }
        }

        self.gamma.accumulate(&grad_gamma);
        self.beta.accumulate(&grad_beta);
        Tensor::from_vec(&dims, dx)
    }
}

impl Module for Normalization {
    fn visit_parameters(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Parameter)) {
        f(&join_name(prefix, "weight"), &mut self.gamma);
        f(&join_name(prefix, "bias"), &mut self.beta);
    }

    fn visit_buffers(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Tensor)) {
        if self.kind == NormKind::Batch {
            f(&join_name(prefix, "running_mean"), &mut self.running_mean);
            f(&join_name(prefix, "running_var"), &mut self.running_var);
        }
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    #[serde(alias = "leaky_relu")]
    LeakyRelu,
    Elu,
    Sigmoid,
    Tanh,
    Softmax,
}

#[derive(Debug, Clone)]
pub struct ActivationLayer {
    pub kind: Activation,
    cache: Option<(Tensor, Tensor)>,
}

const LEAKY_SLOPE: f32 = 0.01;

fn softmax_channels(input: &Tensor) -> Tensor {
    let (n, c, plane) = (input.shape().batch(), input.shape().channels(), input.plane_len());
    let x = input.data();
    let mut out = vec![0.0f32; x.len()];
    for b in 0..n {
        for s in 0..plane {
            let at = |ch: usize| (b * c + ch) * plane + s;
            let max = (0..c).map(|ch| x[at(ch)]).fold(f32::NEG_INFINITY, f32::max);
            let mut total = 0.0;
            for ch in 0..c {
                let e = (x[at(ch)] - max).exp();
                out[at(ch)] = e;
                total += e;
            }
            for ch in 0..c {
                out[at(ch)] /= total;
            }
        }
    }
    // dims were validated by the caller
    Tensor::from_vec(input.dims(), out).unwrap_or_else(|_| input.clone())
}

impl ActivationLayer {
    pub fn new(kind: Activation) -> Self {
        Self { kind, cache: None }
    }

    pub fn forward(&mut self, input: &Tensor) -> NodeResult<Tensor> {
        let output = match self.kind {
            Activation::Relu => input.map(|v| v.max(0.0)),
            Activation::LeakyRelu => input.map(|v| if v > 0.0 { v } else { LEAKY_SLOPE * v }),
            Activation::Elu => input.map(|v| if v > 0.0 { v } else { v.exp() - 1.0 }),
            Activation::Sigmoid => input.map(|v| 1.0 / (1.0 + (-v).exp())),
            Activation::Tanh => input.map(f32::tanh),
            Activation::Softmax => {
                if input.shape().ndim() < 2 {
                    return Err(NodeError::shape_error("[N, C, ...]", &input.shape().to_string(), None));
                }
                softmax_channels(input)
            }
        };
        self.cache = Some((input.clone(), output.clone()));
        Ok(output)
    }

    pub fn backward(&mut self, grad_output: &Tensor) -> NodeResult<Tensor> {
        let (input, output) = self
            .cache
            .take()
            .ok_or_else(|| NodeError::operation_error("activation_backward", "backward called before forward"))?;
        input.expect_same_shape(grad_output, "activation_backward")?;
        match self.kind {
            Activation::Relu => input.zip_map(grad_output, |x, g| if x > 0.0 { g } else { 0.0 }),
            Activation::LeakyRelu => input.zip_map(grad_output, |x, g| if x > 0.0 { g } else { LEAKY_SLOPE * g }),
            Activation::Elu => {
                let slope = input.zip_map(&output, |x, y| if x > 0.0 { 1.0 } else { y + 1.0 })?;
                slope.zip_map(grad_output, |s, g| s * g)
            }
            Activation::Sigmoid => output.zip_map(grad_output, |y, g| g * y * (1.0 - y)),
            Activation::Tanh => output.zip_map(grad_output, |y, g| g * (1.0 - y * y)),
            Activation::Softmax => {
                let (n, c, plane) = (output.shape().batch(), output.shape().channels(), output.plane_len());
                let y = output.data();
                let dy = grad_output.data();
                let mut dx = vec![0.0f32; y.len()];
                for b in 0..n {
                    for s in 0..plane {
                        let at = |ch: usize| (b * c + ch) * plane + s;
                        let dot: f32 = (0..c).map(|ch| y[at(ch)] * dy[at(ch)]).sum();
                        for ch in 0..c {
                            dx[at(ch)] = y[at(ch)] * (dy[at(ch)] - dot);
                        }
                    }
                }
                Tensor::from_vec(output.dims(), dx)
            }
        }
    }
}

/// Inverted element-wise dropout, active only while training.
#[derive(Debug, Clone)]
pub struct Dropout {
    pub p: f32,
    training: bool,
    rng: StdRng,
    mask: Option<Vec<f32>>,
}

impl Dropout {
    pub fn new(p: f32, seed: u64) -> NodeResult<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(NodeError::InvalidConfig(format!("dropout probability {} not in [0, 1)", p)));
        }
        Ok(Self {
            p,
            training: true,
            rng: StdRng::seed_from_u64(seed),
            mask: None,
        })
    }

    pub fn forward(&mut self, input: &Tensor) -> NodeResult<Tensor> {
        if !self.training || self.p == 0.0 {
            self.mask = None;
            return Ok(input.clone());
        }
        let keep = 1.0 - self.p;
        let mask: Vec<f32> = (0..input.numel())
            .map(|_| if self.rng.gen::<f32>() < keep { 1.0 / keep } else { 0.0 })
            .collect();
        let out = input.data().iter().zip(&mask).map(|(x, m)| x * m).collect();
        self.mask = Some(mask);
        Tensor::from_vec(input.dims(), out)
    }

    pub fn backward(&mut self, grad_output: &Tensor) -> NodeResult<Tensor> {
        match self.mask.take() {
            None => Ok(grad_output.clone()),
            Some(mask) => {
                let out = grad_output.data().iter().zip(&mask).map(|(g, m)| g * m).collect();
                Tensor::from_vec(grad_output.dims(), out)
            }
        }
    }
}

impl Module for Dropout {
    fn visit_parameters(&mut self, _prefix: &str, _f: &mut dyn FnMut(&str, &mut Parameter)) {}

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;

    pub(crate) fn smooth(dims: &[usize], phase: f32) -> Tensor {
        let n: usize = dims.iter().product();
        Tensor::from_vec(dims, (0..n).map(|i| ((i as f32 + phase) * 0.73).sin()).collect()).unwrap()
    }

    fn dot(a: &Tensor, b: &Tensor) -> f32 {
        a.data().iter().zip(b.data()).map(|(x, y)| x * y).sum()
    }

    /// Checks d<f(x), g>/dx against central differences at a few entries.
    fn check_input_grad<F>(x: &Tensor, g: &Tensor, analytic: &Tensor, mut f: F)
    where
        F: FnMut(&Tensor) -> Tensor,
    {
        let h = 1e-2;
        for idx in (0..x.numel()).step_by((x.numel() / 7).max(1)) {
            let mut plus = x.clone();
            plus.data_mut()[idx] += h;
            let mut minus = x.clone();
            minus.data_mut()[idx] -= h;
            let numeric = (dot(&f(&plus), g) - dot(&f(&minus), g)) / (2.0 * h);
            assert_relative_eq!(analytic.data()[idx], numeric, epsilon = 2e-2, max_relative = 5e-2);
        }
    }

    #[test]
    fn test_conv_same_padding_shape_and_identity() {
        let x = smooth(&[2, 3, 4, 5, 3], 0.0);
        let mut conv = Conv::new(Conv::identity_weight(3, 3).unwrap(), false).unwrap();
        let y = conv.forward(&x).unwrap();
        assert_eq!(y, x);
    }

    #[test]
    fn test_conv_rejects_even_kernel() {
        assert!(Conv::new(Tensor::zeros(&[1, 1, 2, 2]), true).is_err());
    }

    #[test]
    fn test_conv_known_values_1d() {
        let weight = Tensor::from_vec(&[1, 1, 3], vec![1.0, 2.0, 3.0]).unwrap();
        let mut conv = Conv::new(weight, true).unwrap();
        let x = Tensor::from_vec(&[1, 1, 3], vec![1.0, 1.0, 1.0]).unwrap();
        let y = conv.forward(&x).unwrap();
        // zero padded edges drop one tap each
        assert_eq!(y.data(), &[5.0, 6.0, 3.0]);
    }

    #[test]
    fn test_conv_gradients() {
        let mut rng = StdRng::seed_from_u64(3);
        let weight = Conv::kaiming_uniform(&[2, 3, 3, 3], &mut rng).unwrap();
        let x = smooth(&[2, 3, 4, 5], 0.2);
        let mut conv = Conv::new(weight.clone(), true).unwrap();
        let y = conv.forward(&x).unwrap();
        let g = smooth(y.dims(), 1.7);
        let gx = conv.backward(&g).unwrap();
        check_input_grad(&x, &g, &gx, |xp| Conv::new(weight.clone(), true).unwrap().forward(xp).unwrap());

        let h = 1e-2;
        for idx in [0, 7, 20, 53] {
            let mut wp = weight.clone();
            wp.data_mut()[idx] += h;
            let mut wm = weight.clone();
            wm.data_mut()[idx] -= h;
            let fp = dot(&Conv::new(wp, true).unwrap().forward(&x).unwrap(), &g);
            let fm = dot(&Conv::new(wm, true).unwrap().forward(&x).unwrap(), &g);
            assert_relative_eq!(conv.weight.grad.data()[idx], (fp - fm) / (2.0 * h), epsilon = 2e-2, max_relative = 5e-2);
        }
        assert_relative_eq!(conv.bias.grad.data()[1], g.split_channels(&[1, 1]).unwrap()[1].sum(), epsilon = 1e-4);
    }

    #[test]
    fn test_frozen_conv_accumulates_nothing() {
        let mut conv = Conv::new(Tensor::full(&[1, 1, 3], 0.5), false).unwrap();
        let x = smooth(&[1, 1, 6], 0.0);
        let y = conv.forward(&x).unwrap();
        conv.backward(&y).unwrap();
        assert_eq!(conv.weight.grad.sum(), 0.0);
    }

    #[test]
    fn test_batch_norm_normalizes_and_tracks_stats() {
        let mut norm = Normalization::new(NormKind::Batch, 2);
        let x = smooth(&[3, 2, 4], 0.0).map(|v| 3.0 * v + 2.0);
        let y = norm.forward(&x).unwrap();
        for part in y.split_channels(&[1, 1]).unwrap() {
            assert_relative_eq!(part.mean(), 0.0, epsilon = 1e-5);
        }
        assert!(norm.running_mean.data()[0].abs() > 0.0);
        norm.set_training(false);
        let eval = norm.forward(&x).unwrap();
        assert_ne!(eval, y);
    }

    #[test]
    fn test_norm_gradients() {
        for kind in [NormKind::Batch, NormKind::Instance] {
            let x = smooth(&[2, 2, 5], 0.4);
            let mut norm = Normalization::new(kind, 2);
            norm.gamma.value = Tensor::from_vec(&[2], vec![1.5, 0.7]).unwrap();
            let y = norm.forward(&x).unwrap();
            let g = smooth(y.dims(), 2.1);
            let gx = norm.backward(&g).unwrap();
            let gamma = norm.gamma.value.clone();
            check_input_grad(&x, &g, &gx, |xp| {
                let mut fresh = Normalization::new(kind, 2);
                fresh.gamma.value = gamma.clone();
                fresh.forward(xp).unwrap()
            });
        }
    }

    #[test]
    fn test_activation_gradients() {
        for kind in [
            Activation::Relu,
            Activation::LeakyRelu,
            Activation::Elu,
            Activation::Sigmoid,
            Activation::Tanh,
            Activation::Softmax,
        ] {
            // keep away from the relu kink
            let x = smooth(&[2, 3, 4], 0.9).map(|v| if v.abs() < 0.05 { 0.3 } else { v });
            let mut act = ActivationLayer::new(kind);
            let y = act.forward(&x).unwrap();
            let g = smooth(y.dims(), 0.3);
            let gx = act.backward(&g).unwrap();
            check_input_grad(&x, &g, &gx, |xp| ActivationLayer::new(kind).forward(xp).unwrap());
        }
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let x = smooth(&[1, 4, 3], 0.0);
        let y = ActivationLayer::new(Activation::Softmax).forward(&x).unwrap();
        for s in 0..3 {
            let total: f32 = (0..4).map(|c| y.data()[c * 3 + s]).sum();
            assert_relative_eq!(total, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_dropout_is_identity_in_eval() {
        let mut drop = Dropout::new(0.5, 1).unwrap();
        let x = Tensor::full(&[1, 1, 1000], 1.0);
        let y = drop.forward(&x).unwrap();
        assert!(y.data().iter().all(|&v| v == 0.0 || v == 2.0));
        assert!((y.mean() - 1.0).abs() < 0.15);
        drop.set_training(false);
        assert_eq!(drop.forward(&x).unwrap(), x);
        assert!(Dropout::new(1.0, 0).is_err());
    }

    #[test]
    fn test_state_dict_roundtrip() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut a = Conv::new(Conv::kaiming_uniform(&[2, 1, 3], &mut rng).unwrap(), true).unwrap();
        let mut b = Conv::new(Tensor::zeros(&[2, 1, 3]), true).unwrap();
        let state = a.state_dict();
        assert_eq!(b.load_state_dict(&state, true).unwrap(), 2);
        assert_eq!(a.weight.value, b.weight.value);

        let mut wrong = Conv::new(Tensor::zeros(&[3, 1, 3]), true).unwrap();
        assert!(wrong.load_state_dict(&state, true).is_err());
        assert_eq!(a.num_parameters(), 8);
    }
}
