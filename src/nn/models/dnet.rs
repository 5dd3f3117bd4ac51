use rand::{rngs::StdRng, Rng};

use super::{ConvSpec, HyperedgeParams};
use crate::error::{NodeError, NodeResult};
use crate::nn::layers::{join_name, ActivationLayer, Conv, Dropout, Module, Normalization, Parameter};
use crate::tensor::Tensor;

/// `conv -> norm? -> act? -> dropout?`
#[derive(Debug, Clone)]
struct Block {
    conv: Conv,
    norm: Option<Normalization>,
    act: Option<ActivationLayer>,
    dropout: Option<Dropout>,
}

/// Convolution block run by a single hyperedge.
#[derive(Debug, Clone)]
pub struct DNet {
    blocks: Vec<Block>,
}

fn build_weight(spec: &ConvSpec, num_dimensions: usize, rng: &mut StdRng) -> NodeResult<Tensor> {
    let weight = match spec {
        ConvSpec::Shape(shape) => Conv::kaiming_uniform(shape, rng)?,
        ConvSpec::Identity { identity } => Conv::identity_weight(*identity, num_dimensions)?,
        ConvSpec::Values { shape, values } => Tensor::from_vec(shape, values.clone())?,
    };
    if weight.dims().len() != num_dimensions + 2 {
        return Err(NodeError::shape_error(
            &format!("conv weight with {} kernel dims", num_dimensions),
            &weight.shape().to_string(),
            None,
        ));
    }
    Ok(weight)
}

fn per_block<T: Clone>(values: &[T], n: usize, default: T, what: &str) -> NodeResult<Vec<T>> {
    match values.len() {
        0 => Ok(vec![default; n]),
        len if len == n => Ok(values.to_vec()),
        len => Err(NodeError::InvalidConfig(format!(
            "{} has {} entries but there are {} convs",
            what, len, n
        ))),
    }
}

impl DNet {
    pub fn new(params: &HyperedgeParams, num_dimensions: usize, rng: &mut StdRng) -> NodeResult<Self> {
        let n = params.convs.len();
        if n == 0 {
            return Err(NodeError::InvalidConfig("a hyperedge needs at least one conv".to_string()));
        }
        let reqs = per_block(&params.reqs, n, true, "reqs")?;
        let norms = per_block(&params.norms, n, None, "norms")?;
        let acts = per_block(&params.acts, n, None, "acts")?;

        let mut blocks = Vec::with_capacity(n);
        for i in 0..n {
            let conv = Conv::new(build_weight(&params.convs[i], num_dimensions, rng)?, reqs[i])?;
            if let Some(prev) = blocks.last().map(|b: &Block| b.conv.out_channels()) {
                if prev != conv.in_channels() {
                    return Err(NodeError::shape_error(
                        &format!("conv {} with {} input channels", i, prev),
                        &format!("{} input channels", conv.in_channels()),
                        Some("each conv must consume the previous conv's output channels"),
                    ));
                }
            }
            let channels = conv.out_channels();
            let dropout = match params.dropout {
                Some(p) if p > 0.0 => Some(Dropout::new(p, rng.gen())?),
                _ => None,
            };
            blocks.push(Block {
                conv,
                norm: norms[i].map(|kind| Normalization::new(kind, channels)),
                act: acts[i].map(ActivationLayer::new),
                dropout,
            });
        }
        Ok(Self { blocks })
    }

    pub fn in_channels(&self) -> usize {
        self.blocks.first().map_or(0, |b| b.conv.in_channels())
    }

    pub fn out_channels(&self) -> usize {
        self.blocks.last().map_or(0, |b| b.conv.out_channels())
    }

    pub fn forward(&mut self, input: &Tensor) -> NodeResult<Tensor> {
        let mut x = input.clone();
        for block in &mut self.blocks {
            x = block.conv.forward(&x)?;
            if let Some(norm) = &mut block.norm {
                x = norm.forward(&x)?;
            }
            if let Some(act) = &mut block.act {
                x = act.forward(&x)?;
            }
            if let Some(dropout) = &mut block.dropout {
                x = dropout.forward(&x)?;
            }
        }
        Ok(x)
    }

    pub fn backward(&mut self, grad_output: &Tensor) -> NodeResult<Tensor> {
        let mut g = grad_output.clone();
        for block in self.blocks.iter_mut().rev() {
            if let Some(dropout) = &mut block.dropout {
                g = dropout.backward(&g)?;
            }
            if let Some(act) = &mut block.act {
                g = act.backward(&g)?;
            }
            if let Some(norm) = &mut block.norm {
                g = norm.backward(&g)?;
            }
            g = block.conv.backward(&g)?;
        }
        Ok(g)
    }
}

impl Module for DNet {
    fn visit_parameters(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Parameter)) {
        for (i, block) in self.blocks.iter_mut().enumerate() {
            let base = join_name(prefix, &i.to_string());
            block.conv.visit_parameters(&join_name(&base, "conv"), f);
            if let Some(norm) = &mut block.norm {
                norm.visit_parameters(&join_name(&base, "norm"), f);
            }
        }
    }

    fn visit_buffers(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Tensor)) {
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if let Some(norm) = &mut block.norm {
                let base = join_name(prefix, &i.to_string());
                norm.visit_buffers(&join_name(&base, "norm"), f);
            }
        }
    }

    fn set_training(&mut self, training: bool) {
        for block in &mut self.blocks {
            if let Some(norm) = &mut block.norm {
                norm.set_training(training);
            }
            if let Some(dropout) = &mut block.dropout {
                dropout.set_training(training);
            }
        }
    }
}
