//! Per-sample transforms over channel-first tensors `[C, S...]`.
//!
//! Random transforms seed their generator from the sample seed mixed with a
//! per-kind salt. Two nodes loading the same case with the same seed
//! therefore receive identical geometry, whatever else is in their lists.

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};
use crate::tensor::{spatial3, Tensor};

/// A per-sample transform.
pub trait Transform: Send + Sync {
    fn apply(&self, sample: &Tensor, seed: u64) -> NodeResult<Tensor>;

    fn name(&self) -> &'static str;
}

fn rng_for(seed: u64, salt: u64) -> StdRng {
    StdRng::seed_from_u64(seed ^ salt)
}

/// Channel-first view: channels, padded spatial dims and the index of the
/// first real spatial axis within them.
struct Layout {
    channels: usize,
    dims: [usize; 3],
    first: usize,
}

impl Layout {
    fn of(sample: &Tensor) -> NodeResult<Self> {
        let d = sample.dims();
        if d.len() < 2 || d.len() > 4 {
            return Err(NodeError::shape_error(
                "[C, S...] with 1-3 spatial dims",
                &sample.shape().to_string(),
                None,
            ));
        }
        Ok(Self {
            channels: d[0],
            dims: spatial3(&d[1..])?,
            first: 4 - d.len(),
        })
    }

    fn plane(&self) -> usize {
        self.dims.iter().product()
    }

    fn axes(&self) -> std::ops::Range<usize> {
        self.first..3
    }

    fn index(&self, p: [usize; 3]) -> usize {
        (p[0] * self.dims[1] + p[1]) * self.dims[2] + p[2]
    }

    fn positions(&self) -> impl Iterator<Item = [usize; 3]> + '_ {
        let [a, b, c] = self.dims;
        (0..a).flat_map(move |i| (0..b).flat_map(move |j| (0..c).map(move |k| [i, j, k])))
    }
}

// Zero outside the volume.
fn sample_at(channel: &[f32], layout: &Layout, pos: [f32; 3], nearest: bool) -> f32 {
    let dims = layout.dims;
    if nearest {
        let mut p = [0usize; 3];
        for a in 0..3 {
            let r = pos[a].round();
            if r < 0.0 || r >= dims[a] as f32 {
                return 0.0;
            }
            p[a] = r as usize;
        }
        return channel[layout.index(p)];
    }
    let base = [pos[0].floor(), pos[1].floor(), pos[2].floor()];
    let frac = [pos[0] - base[0], pos[1] - base[1], pos[2] - base[2]];
    let mut acc = 0.0f32;
    for corner in 0..8usize {
        let mut weight = 1.0f32;
        let mut p = [0usize; 3];
        let mut inside = true;
        for a in 0..3 {
            let hi = (corner >> (2 - a)) & 1 == 1;
            let w = if hi { frac[a] } else { 1.0 - frac[a] };
            if w == 0.0 {
                weight = 0.0;
                break;
            }
            let coord = base[a] as i64 + i64::from(hi);
            if coord < 0 || coord >= dims[a] as i64 {
                inside = false;
                break;
            }
            weight *= w;
            p[a] = coord as usize;
        }
        if inside && weight != 0.0 {
            acc += weight * channel[layout.index(p)];
        }
    }
    acc
}

// Output voxel `p` takes the input value at `source(p)`.
fn warp<F: Fn([f32; 3]) -> [f32; 3]>(sample: &Tensor, layout: &Layout, source: F, nearest: bool) -> NodeResult<Tensor> {
    let plane = layout.plane();
    let mut out = Vec::with_capacity(sample.numel());
    for c in 0..layout.channels {
        let channel = &sample.data()[c * plane..(c + 1) * plane];
        for p in layout.positions() {
            let pos = source([p[0] as f32, p[1] as f32, p[2] as f32]);
            out.push(sample_at(channel, layout, pos, nearest));
        }
    }
    Tensor::from_vec(sample.dims(), out)
}

fn centre(layout: &Layout) -> [f32; 3] {
    [
        (layout.dims[0] as f32 - 1.0) / 2.0,
        (layout.dims[1] as f32 - 1.0) / 2.0,
        (layout.dims[2] as f32 - 1.0) / 2.0,
    ]
}

fn per_channel<F: Fn(&[f32], &mut Vec<f32>)>(sample: &Tensor, f: F) -> NodeResult<Tensor> {
    let layout = Layout::of(sample)?;
    let plane = layout.plane();
    let mut out = Vec::with_capacity(sample.numel());
    for chunk in sample.data().chunks(plane.max(1)) {
        f(chunk, &mut out);
    }
    Tensor::from_vec(sample.dims(), out)
}

/// Rescales each channel to `[0, 1]`; constant channels become zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MinMaxNormalize;

impl Transform for MinMaxNormalize {
    fn apply(&self, sample: &Tensor, _seed: u64) -> NodeResult<Tensor> {
        per_channel(sample, |chunk, out| {
            let min = chunk.iter().copied().fold(f32::INFINITY, f32::min);
            let max = chunk.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let range = max - min;
            if range > 0.0 {
                out.extend(chunk.iter().map(|v| (v - min) / range));
            } else {
                out.extend(std::iter::repeat(0.0).take(chunk.len()));
            }
        })
    }

    fn name(&self) -> &'static str {
        "MinMaxNormalize"
    }
}

/// Standardises each channel to zero mean and unit variance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ZScoreNormalize;

impl Transform for ZScoreNormalize {
    fn apply(&self, sample: &Tensor, _seed: u64) -> NodeResult<Tensor> {
        per_channel(sample, |chunk, out| {
            let n = chunk.len().max(1) as f32;
            let mean = chunk.iter().sum::<f32>() / n;
            let var = chunk.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
            let std = var.sqrt();
            if std > 0.0 {
                out.extend(chunk.iter().map(|v| (v - mean) / std));
            } else {
                out.extend(chunk.iter().map(|v| v - mean));
            }
        })
    }

    fn name(&self) -> &'static str {
        "ZScoreNormalize"
    }
}

/// Rotation by up to `max_angle` degrees in one randomly chosen spatial
/// plane, about the volume centre.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RandomRotate {
    pub max_angle: f32,
    /// Nearest-neighbour sampling, for label maps.
    #[serde(default)]
    pub nearest: bool,
}

impl RandomRotate {
    pub fn new(max_angle: f32) -> Self {
        Self {
            max_angle,
            nearest: false,
        }
    }
}

impl Transform for RandomRotate {
    fn apply(&self, sample: &Tensor, seed: u64) -> NodeResult<Tensor> {
        if !self.max_angle.is_finite() {
            return Err(NodeError::InvalidConfig(format!(
                "rotation angle must be finite, got {}",
                self.max_angle
            )));
        }
        let layout = Layout::of(sample)?;
        let axes: Vec<usize> = layout.axes().collect();
        if axes.len() < 2 || self.max_angle == 0.0 {
            return Ok(sample.clone());
        }
        let planes: Vec<(usize, usize)> = axes
            .iter()
            .enumerate()
            .flat_map(|(i, &a)| axes[i + 1..].iter().map(move |&b| (a, b)))
            .collect();
        let mut rng = rng_for(seed, 0x5201_0001);
        let (a, b) = planes[rng.gen_range(0..planes.len())];
        // wider ranges repeat the same rotations
        let max = self.max_angle.abs().min(180.0);
        let angle = rng.gen_range(-max..=max).to_radians();
        let (sin, cos) = angle.sin_cos();
        let c = centre(&layout);
        warp(
            sample,
            &layout,
            |p| {
                let (u, v) = (p[a] - c[a], p[b] - c[b]);
                let mut src = p;
                src[a] = cos * u + sin * v + c[a];
                src[b] = -sin * u + cos * v + c[b];
                src
            },
            self.nearest,
        )
    }

    fn name(&self) -> &'static str {
        "RandomRotate"
    }
}

/// Flips every spatial axis independently with probability `prob`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RandomFlip {
    #[serde(default = "default_flip_prob")]
    pub prob: f32,
}

fn default_flip_prob() -> f32 {
    0.5
}

impl Default for RandomFlip {
    fn default() -> Self {
        Self { prob: 0.5 }
    }
}

impl Transform for RandomFlip {
    fn apply(&self, sample: &Tensor, seed: u64) -> NodeResult<Tensor> {
        if !(0.0..=1.0).contains(&self.prob) {
            return Err(NodeError::InvalidConfig(format!("flip prob must be in [0, 1], got {}", self.prob)));
        }
        let layout = Layout::of(sample)?;
        let mut rng = rng_for(seed, 0x5201_0002);
        let mut flip = [false; 3];
        for a in layout.axes() {
            flip[a] = rng.gen::<f32>() < self.prob;
        }
        if !flip.iter().any(|&f| f) {
            return Ok(sample.clone());
        }
        let dims = layout.dims;
        warp(
            sample,
            &layout,
            |p| {
                let mut src = p;
                for a in 0..3 {
                    if flip[a] {
                        src[a] = (dims[a] - 1) as f32 - p[a];
                    }
                }
                src
            },
            true,
        )
    }

    fn name(&self) -> &'static str {
        "RandomFlip"
    }
}

/// Integer translation of up to `max_shift` voxels per axis, zero filled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RandomShift {
    pub max_shift: usize,
}

impl Transform for RandomShift {
    fn apply(&self, sample: &Tensor, seed: u64) -> NodeResult<Tensor> {
        let layout = Layout::of(sample)?;
        let mut rng = rng_for(seed, 0x5201_0003);
        let m = self.max_shift as i64;
        let mut shift = [0i64; 3];
        for a in layout.axes() {
            shift[a] = rng.gen_range(-m..=m);
        }
        warp(
            sample,
            &layout,
            |p| [p[0] - shift[0] as f32, p[1] - shift[1] as f32, p[2] - shift[2] as f32],
            true,
        )
    }

    fn name(&self) -> &'static str {
        "RandomShift"
    }
}

/// Centre zoom by a factor drawn from `zoom_range`, keeping the size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RandomZoom {
    #[serde(default = "default_zoom_range")]
    pub zoom_range: [f32; 2],
    #[serde(default)]
    pub nearest: bool,
}

fn default_zoom_range() -> [f32; 2] {
    [0.9, 1.1]
}

impl RandomZoom {
    pub fn new(low: f32, high: f32) -> Self {
        Self {
            zoom_range: [low, high],
            nearest: false,
        }
    }
}

impl Transform for RandomZoom {
    fn apply(&self, sample: &Tensor, seed: u64) -> NodeResult<Tensor> {
        let [low, high] = self.zoom_range;
        if !(low > 0.0 && low <= high && high.is_finite()) {
            return Err(NodeError::InvalidConfig(format!(
                "zoom range must satisfy 0 < low <= high < inf, got [{}, {}]",
                low, high
            )));
        }
        let layout = Layout::of(sample)?;
        let mut rng = rng_for(seed, 0x5201_0004);
        let factor = if low == high { low } else { rng.gen_range(low..=high) };
        let c = centre(&layout);
        warp(
            sample,
            &layout,
            |p| [c[0] + (p[0] - c[0]) / factor, c[1] + (p[1] - c[1]) / factor, c[2] + (p[2] - c[2]) / factor],
            self.nearest,
        )
    }

    fn name(&self) -> &'static str {
        "RandomZoom"
    }
}

/// Zeroes `num_masks` cuboids whose sides are `mask_ratio` of each axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RandomMask {
    #[serde(default = "default_mask_ratio")]
    pub mask_ratio: f32,
    #[serde(default = "default_num_masks")]
    pub num_masks: usize,
}

fn default_mask_ratio() -> f32 {
    0.25
}

fn default_num_masks() -> usize {
    1
}

impl Default for RandomMask {
    fn default() -> Self {
        Self {
            mask_ratio: default_mask_ratio(),
            num_masks: default_num_masks(),
        }
    }
}

impl Transform for RandomMask {
    fn apply(&self, sample: &Tensor, seed: u64) -> NodeResult<Tensor> {
        if !(0.0..=1.0).contains(&self.mask_ratio) {
            return Err(NodeError::InvalidConfig(format!(
                "mask ratio must be in [0, 1], got {}",
                self.mask_ratio
            )));
        }
        let layout = Layout::of(sample)?;
        let mut rng = rng_for(seed, 0x5201_0005);
        let mut out = sample.clone();
        let plane = layout.plane();
        for _ in 0..self.num_masks {
            let mut lo = [0usize; 3];
            let mut hi = layout.dims;
            for a in layout.axes() {
                let len = layout.dims[a];
                let side = ((self.mask_ratio * len as f32).round() as usize).clamp(1, len);
                lo[a] = rng.gen_range(0..=len - side);
                hi[a] = lo[a] + side;
            }
            for p in layout.positions() {
                if (0..3).all(|a| p[a] >= lo[a] && p[a] < hi[a]) {
                    let i = layout.index(p);
                    for c in 0..layout.channels {
                        out.data_mut()[c * plane + i] = 0.0;
                    }
                }
            }
        }
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "RandomMask"
    }
}

/// Expands a single-channel label map into `num_classes` indicator channels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OneHot {
    pub num_classes: usize,
}

impl Transform for OneHot {
    fn apply(&self, sample: &Tensor, _seed: u64) -> NodeResult<Tensor> {
        let layout = Layout::of(sample)?;
        if layout.channels != 1 {
            return Err(NodeError::shape_error(
                "[1, S...]",
                &sample.shape().to_string(),
                Some("one-hot encoding needs a single label channel"),
            ));
        }
        let plane = layout.plane();
        let mut out = vec![0.0f32; self.num_classes * plane];
        for (i, &v) in sample.data().iter().enumerate() {
            let class = v.round();
            if class < 0.0 || class >= self.num_classes as f32 {
                return Err(NodeError::InvalidData(format!(
                    "label {} outside {} classes",
                    v, self.num_classes
                )));
            }
            out[class as usize * plane + i] = 1.0;
        }
        let mut dims = sample.dims().to_vec();
        dims[0] = self.num_classes;
        Tensor::from_vec(&dims, out)
    }

    fn name(&self) -> &'static str {
        "OneHot"
    }
}

/// A transform as written in a configuration file,
/// `{"type": "random_rotate", "max_angle": 5}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformConfig {
    MinMaxNormalize,
    ZScoreNormalize,
    RandomRotate(RandomRotate),
    RandomFlip(RandomFlip),
    RandomShift(RandomShift),
    RandomZoom(RandomZoom),
    RandomMask(RandomMask),
    OneHot(OneHot),
}

impl TransformConfig {
    pub fn as_transform(&self) -> &dyn Transform {
        match self {
            TransformConfig::MinMaxNormalize => &MinMaxNormalize,
            TransformConfig::ZScoreNormalize => &ZScoreNormalize,
            TransformConfig::RandomRotate(t) => t,
            TransformConfig::RandomFlip(t) => t,
            TransformConfig::RandomShift(t) => t,
            TransformConfig::RandomZoom(t) => t,
            TransformConfig::RandomMask(t) => t,
            TransformConfig::OneHot(t) => t,
        }
    }
}

/// Applies `transforms` in order with the same sample seed.
pub fn apply_all(transforms: &[TransformConfig], sample: Tensor, seed: u64) -> NodeResult<Tensor> {
    transforms
        .iter()
        .try_fold(sample, |acc, t| t.as_transform().apply(&acc, seed))
}
