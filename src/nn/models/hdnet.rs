use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use rand::rngs::StdRng;
use tracing::debug;

use super::{DNet, HDNetConfig, NodeId};
use crate::error::{NodeError, NodeResult};
use crate::nn::layers::{join_name, Module, Parameter};
use crate::tensor::{resample, Interpolation, ResampleCache, Tensor};

#[derive(Debug, Clone)]
struct Edge {
    name: String,
    src: Vec<NodeId>,
    dst: Vec<NodeId>,
    net: DNet,
    feature_size: Vec<usize>,
    intp: Interpolation,
    src_cache: Vec<ResampleCache>,
    dst_cache: Vec<ResampleCache>,
}

/// A hypergraph network.
///
/// Each hyperedge resamples its source nodes to `feature_size`, concatenates
/// them along channels, runs its [`DNet`], splits the result across its
/// destination nodes and resamples every chunk to the destination's size. A
/// node fed by several hyperedges holds the sum of their contributions.
#[derive(Debug, Clone)]
pub struct HDNet {
    config: HDNetConfig,
    edges: Vec<Edge>,
    batch: Option<usize>,
}

impl HDNet {
    pub fn new(config: HDNetConfig, rng: &mut StdRng) -> NodeResult<Self> {
        validate_nodes(&config)?;
        let order = edge_order(&config)?;

        let mut edges = Vec::with_capacity(order.len());
        for name in order {
            let edge = &config.hyperedges[&name];
            let params = &edge.params;
            if params.feature_size.len() != config.num_dimensions || params.feature_size.contains(&0) {
                return Err(NodeError::InvalidConfig(format!(
                    "hyperedge {}: feature_size {:?} must have {} non-zero dims",
                    name, params.feature_size, config.num_dimensions
                )));
            }
            let net = DNet::new(params, config.num_dimensions, rng)
                .map_err(|e| NodeError::InvalidConfig(format!("hyperedge {}: {}", name, e)))?;
            let src_channels: usize = edge.src_nodes.iter().map(|n| config.node_configs[n][0]).sum();
            let dst_channels: usize = edge.dst_nodes.iter().map(|n| config.node_configs[n][0]).sum();
            if net.in_channels() != src_channels || net.out_channels() != dst_channels {
                return Err(NodeError::shape_error(
                    &format!("{} -> {} channels", src_channels, dst_channels),
                    &format!("{} -> {} channels", net.in_channels(), net.out_channels()),
                    Some(&format!("hyperedge {} convs must match its source and destination nodes", name)),
                ));
            }
            edges.push(Edge {
                src: edge.src_nodes.clone(),
                dst: edge.dst_nodes.clone(),
                net,
                feature_size: params.feature_size.clone(),
                intp: params.intp,
                name,
                src_cache: Vec::new(),
                dst_cache: Vec::new(),
            });
        }
        debug!(
            edges = ?edges.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            "hyperedge execution order"
        );
        Ok(Self { config, edges, batch: None })
    }

    pub fn config(&self) -> &HDNetConfig {
        &self.config
    }

    pub fn in_nodes(&self) -> &[NodeId] {
        &self.config.in_nodes
    }

    pub fn out_nodes(&self) -> &[NodeId] {
        &self.config.out_nodes
    }

    pub fn node_shape(&self, node: &str) -> Option<&[usize]> {
        self.config.node_configs.get(node).map(|s| s.as_slice())
    }

    /// Hyperedge names in execution order.
    pub fn edge_order(&self) -> Vec<&str> {
        self.edges.iter().map(|e| e.name.as_str()).collect()
    }

    fn batched_dims(&self, node: &str, batch: usize) -> Vec<usize> {
        let mut dims = vec![batch];
        dims.extend_from_slice(&self.config.node_configs[node]);
        dims
    }

    /// Runs the graph. `inputs` follow `in_nodes`; outputs follow `out_nodes`.
    pub fn forward(&mut self, inputs: &[Tensor]) -> NodeResult<Vec<Tensor>> {
        if inputs.len() != self.config.in_nodes.len() {
            return Err(NodeError::InvalidData(format!(
                "expected {} inputs, got {}",
                self.config.in_nodes.len(),
                inputs.len()
            )));
        }
        let batch = inputs.first().map_or(1, |t| t.shape().batch());
        let mut values: BTreeMap<NodeId, Tensor> = BTreeMap::new();
        for (node, input) in self.config.in_nodes.iter().zip(inputs) {
            let expected = self.batched_dims(node, batch);
            if input.dims() != expected.as_slice() {
                return Err(NodeError::shape_error(
                    &format!("{:?}", expected),
                    &input.shape().to_string(),
                    Some(&format!("input node {}", node)),
                ));
            }
            values.insert(node.clone(), input.clone());
        }

        for edge in &mut self.edges {
            let mut resampled = Vec::with_capacity(edge.src.len());
            edge.src_cache.clear();
            for node in &edge.src {
                let value = values
                    .get(node)
                    .ok_or_else(|| NodeError::GraphError(format!("node {} has no value", node)))?;
                let (out, cache) = resample(value, &edge.feature_size, edge.intp)?;
                resampled.push(out);
                edge.src_cache.push(cache);
            }
            let refs: Vec<&Tensor> = resampled.iter().collect();
            let features = edge.net.forward(&Tensor::concat_channels(&refs)?)?;
            let sizes: Vec<usize> = edge.dst.iter().map(|n| self.config.node_configs[n][0]).collect();
            edge.dst_cache.clear();
            for (node, chunk) in edge.dst.iter().zip(features.split_channels(&sizes)?) {
                let target = &self.config.node_configs[node][1..];
                let (out, cache) = resample(&chunk, target, edge.intp)?;
                edge.dst_cache.push(cache);
                match values.get_mut(node) {
                    Some(existing) => existing.add_assign(&out)?,
                    None => {
                        values.insert(node.clone(), out);
                    }
                }
            }
        }

        self.batch = Some(batch);
        self.config
            .out_nodes
            .iter()
            .map(|node| {
                values
                    .get(node)
                    .cloned()
                    .ok_or_else(|| NodeError::GraphError(format!("output node {} has no value", node)))
            })
            .collect()
    }

    /// Back-propagates output gradients (`None` for outputs without a loss)
    /// and returns the gradients of the inputs in `in_nodes` order.
    pub fn backward(&mut self, grad_outputs: &[Option<Tensor>]) -> NodeResult<Vec<Tensor>> {
        let batch = self
            .batch
            .take()
            .ok_or_else(|| NodeError::operation_error("hdnet_backward", "backward called before forward"))?;
        if grad_outputs.len() != self.config.out_nodes.len() {
            return Err(NodeError::InvalidData(format!(
                "expected {} output gradients, got {}",
                self.config.out_nodes.len(),
                grad_outputs.len()
            )));
        }
        let mut grads: BTreeMap<NodeId, Tensor> = BTreeMap::new();
        for (node, grad) in self.config.out_nodes.iter().zip(grad_outputs) {
            if let Some(grad) = grad {
                accumulate(&mut grads, node, grad)?;
            }
        }

        for edge in self.edges.iter_mut().rev() {
            if !edge.dst.iter().any(|n| grads.contains_key(n)) {
                continue;
            }
            let mut chunks = Vec::with_capacity(edge.dst.len());
            for (node, cache) in edge.dst.iter().zip(&edge.dst_cache) {
                let grad = match grads.get(node) {
                    Some(g) => g.clone(),
                    None => {
                        let mut dims = vec![batch];
                        dims.extend_from_slice(&self.config.node_configs[node]);
                        Tensor::zeros(&dims)
                    }
                };
                chunks.push(cache.backward(&grad)?);
            }
            let refs: Vec<&Tensor> = chunks.iter().collect();
            let grad_features = edge.net.backward(&Tensor::concat_channels(&refs)?)?;
            let sizes: Vec<usize> = edge.src.iter().map(|n| self.config.node_configs[n][0]).collect();
            for ((node, cache), grad) in edge
                .src
                .iter()
                .zip(&edge.src_cache)
                .zip(grad_features.split_channels(&sizes)?)
            {
                accumulate(&mut grads, node, &cache.backward(&grad)?)?;
            }
        }

        Ok(self
            .config
            .in_nodes
            .iter()
            .map(|node| grads.remove(node).unwrap_or_else(|| Tensor::zeros(&self.batched_dims(node, batch))))
            .collect())
    }
}

fn accumulate(grads: &mut BTreeMap<NodeId, Tensor>, node: &str, grad: &Tensor) -> NodeResult<()> {
    match grads.get_mut(node) {
        Some(existing) => existing.add_assign(grad),
        None => {
            grads.insert(node.to_string(), grad.clone());
            Ok(())
        }
    }
}

fn validate_nodes(config: &HDNetConfig) -> NodeResult<()> {
    if !(1..=3).contains(&config.num_dimensions) {
        return Err(NodeError::InvalidConfig(format!(
            "num_dimensions must be 1, 2 or 3, got {}",
            config.num_dimensions
        )));
    }
    for (node, shape) in &config.node_configs {
        if shape.len() != config.num_dimensions + 1 || shape.contains(&0) {
            return Err(NodeError::shape_error(
                &format!("(C, S1..S{}) with non-zero entries", config.num_dimensions),
                &format!("{:?}", shape),
                Some(&format!("node {}", node)),
            ));
        }
    }
    let known = |node: &NodeId, role: &str| -> NodeResult<()> {
        if config.node_configs.contains_key(node) {
            Ok(())
        } else {
            Err(NodeError::GraphError(format!("{} node {} is not in node_configs", role, node)))
        }
    };
    let mut produced = BTreeSet::new();
    for (name, edge) in &config.hyperedges {
        if edge.src_nodes.is_empty() || edge.dst_nodes.is_empty() {
            return Err(NodeError::GraphError(format!(
                "hyperedge {} needs source and destination nodes",
                name
            )));
        }
        for node in &edge.src_nodes {
            known(node, "source")?;
        }
        for node in &edge.dst_nodes {
            known(node, "destination")?;
            produced.insert(node);
        }
    }
    for node in &config.in_nodes {
        known(node, "input")?;
        if produced.contains(node) {
            return Err(NodeError::GraphError(format!(
                "input node {} is also a hyperedge destination",
                node
            )));
        }
    }
    let available = |node: &NodeId| config.in_nodes.contains(node) || produced.contains(node);
    for node in &config.out_nodes {
        known(node, "output")?;
        if !available(node) {
            return Err(NodeError::GraphError(format!("output node {} is never produced", node)));
        }
    }
    for (name, edge) in &config.hyperedges {
        if let Some(node) = edge.src_nodes.iter().find(|n| !available(*n)) {
            return Err(NodeError::GraphError(format!(
                "hyperedge {} reads node {} which is neither an input nor produced",
                name, node
            )));
        }
    }
    Ok(())
}

/// Topological order of hyperedges: producers of a node run before its readers.
fn edge_order(config: &HDNetConfig) -> NodeResult<Vec<String>> {
    let mut graph = DiGraph::<&str, ()>::new();
    let indices: BTreeMap<&str, _> = config
        .hyperedges
        .keys()
        .map(|name| (name.as_str(), graph.add_node(name.as_str())))
        .collect();
    for (producer, p_edge) in &config.hyperedges {
        for (consumer, c_edge) in &config.hyperedges {
            if p_edge.dst_nodes.iter().any(|n| c_edge.src_nodes.contains(n)) {
                graph.add_edge(indices[producer.as_str()], indices[consumer.as_str()], ());
            }
        }
    }
    toposort(&graph, None)
        .map(|order| order.into_iter().map(|idx| graph[idx].to_string()).collect())
        .map_err(|cycle| {
            NodeError::GraphError(format!("hyperedges form a cycle through {}", graph[cycle.node_id()]))
        })
}

impl Module for HDNet {
    fn visit_parameters(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Parameter)) {
        for edge in &mut self.edges {
            edge.net.visit_parameters(&join_name(prefix, &edge.name), f);
        }
    }

    fn visit_buffers(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Tensor)) {
        for edge in &mut self.edges {
            edge.net.visit_buffers(&join_name(prefix, &edge.name), f);
        }
    }

    fn set_training(&mut self, training: bool) {
        for edge in &mut self.edges {
            edge.net.set_training(training);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::layers::tests::smooth;
    use crate::nn::models::fixtures::{edge, hdnet_config};
    use crate::nn::models::ConvSpec;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn chain() -> HDNetConfig {
        hdnet_config(
            &[("a", &[1, 6, 6]), ("b", &[2, 6, 6]), ("c", &[2, 3, 3]), ("d", &[1, 6, 6])],
            vec![
                ("e1", edge(&["a", "b"], &["c"], vec![ConvSpec::Shape(vec![2, 3, 3, 3])], &[4, 4])),
                ("e2", edge(&["c"], &["d"], vec![ConvSpec::Shape(vec![1, 2, 3, 3])], &[6, 6])),
                ("e0", edge(&["a"], &["d"], vec![ConvSpec::Identity { identity: 1 }], &[6, 6])),
            ],
            &["a", "b"],
            &["a", "c", "d"],
            2,
        )
    }

    #[test]
    fn test_edges_run_in_dependency_order() {
        let net = HDNet::new(chain(), &mut rng()).unwrap();
        let order = net.edge_order();
        let pos = |n: &str| order.iter().position(|e| *e == n).unwrap();
        assert!(pos("e1") < pos("e2"));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn test_forward_shapes_and_passthrough() {
        let mut net = HDNet::new(chain(), &mut rng()).unwrap();
        let a = smooth(&[2, 1, 6, 6], 0.0);
        let b = smooth(&[2, 2, 6, 6], 1.0);
        let out = net.forward(&[a.clone(), b]).unwrap();
        assert_eq!(out[0], a);
        assert_eq!(out[1].dims(), &[2, 2, 3, 3]);
        assert_eq!(out[2].dims(), &[2, 1, 6, 6]);
    }

    #[test]
    fn test_multiple_edges_into_one_node_are_summed() {
        let config = hdnet_config(
            &[("a", &[1, 4]), ("d", &[1, 4])],
            vec![
                ("x", edge(&["a"], &["d"], vec![ConvSpec::Identity { identity: 1 }], &[4])),
                ("y", edge(&["a"], &["d"], vec![ConvSpec::Identity { identity: 1 }], &[4])),
            ],
            &["a"],
            &["d"],
            1,
        );
        let mut net = HDNet::new(config, &mut rng()).unwrap();
        let a = smooth(&[1, 1, 4], 0.0);
        let out = net.forward(&[a.clone()]).unwrap();
        assert_eq!(out[0], a.scale(2.0));
    }

    #[test]
    fn test_graph_validation() {
        let cyclic = hdnet_config(
            &[("a", &[1, 4]), ("b", &[1, 4]), ("c", &[1, 4])],
            vec![
                ("x", edge(&["a", "c"], &["b"], vec![ConvSpec::Shape(vec![1, 2, 1])], &[4])),
                ("y", edge(&["b"], &["c"], vec![ConvSpec::Identity { identity: 1 }], &[4])),
            ],
            &["a"],
            &["c"],
            1,
        );
        assert!(matches!(HDNet::new(cyclic, &mut rng()), Err(NodeError::GraphError(_))));

        let orphan = hdnet_config(&[("a", &[1, 4]), ("b", &[1, 4])], vec![], &["a"], &["b"], 1);
        assert!(matches!(HDNet::new(orphan, &mut rng()), Err(NodeError::GraphError(_))));

        let bad_channels = hdnet_config(
            &[("a", &[1, 4]), ("b", &[2, 4])],
            vec![("x", edge(&["a"], &["b"], vec![ConvSpec::Shape(vec![1, 1, 3])], &[4]))],
            &["a"],
            &["b"],
            1,
        );
        assert!(matches!(HDNet::new(bad_channels, &mut rng()), Err(NodeError::ShapeError(_))));

        let input_written = hdnet_config(
            &[("a", &[1, 4])],
            vec![("x", edge(&["a"], &["a"], vec![ConvSpec::Identity { identity: 1 }], &[4]))],
            &["a"],
            &["a"],
            1,
        );
        assert!(HDNet::new(input_written, &mut rng()).is_err());
    }

    #[test]
    fn test_forward_rejects_wrong_input_shape() {
        let mut net = HDNet::new(chain(), &mut rng()).unwrap();
        let a = smooth(&[2, 1, 5, 6], 0.0);
        let b = smooth(&[2, 2, 6, 6], 1.0);
        assert!(net.forward(&[a, b.clone()]).is_err());
        assert!(net.forward(&[b]).is_err());
    }

    #[test]
    fn test_input_gradients_match_finite_differences() {
        let mut net = HDNet::new(chain(), &mut rng()).unwrap();
        let a = smooth(&[1, 1, 6, 6], 0.0);
        let b = smooth(&[1, 2, 6, 6], 1.0);
        let out = net.forward(&[a.clone(), b.clone()]).unwrap();
        let gd = smooth(out[2].dims(), 3.0);
        let grads = net.backward(&[None, None, Some(gd.clone())]).unwrap();

        let objective = |net: &mut HDNet, a: &Tensor| -> f32 {
            let out = net.forward(&[a.clone(), b.clone()]).unwrap();
            out[2].data().iter().zip(gd.data()).map(|(x, g)| x * g).sum()
        };
        let h = 1e-2;
        for idx in [0, 7, 14, 29] {
            let mut plus = a.clone();
            plus.data_mut()[idx] += h;
            let mut minus = a.clone();
            minus.data_mut()[idx] -= h;
            let numeric = (objective(&mut net, &plus) - objective(&mut net, &minus)) / (2.0 * h);
            assert_relative_eq!(grads[0].data()[idx], numeric, epsilon = 2e-2, max_relative = 5e-2);
        }
    }

    #[test]
    fn test_state_names_are_prefixed_by_edge() {
        let mut net = HDNet::new(chain(), &mut rng()).unwrap();
        let state = net.state_dict();
        assert!(state.tensors.contains_key("e1.0.conv.weight"));
        assert!(state.tensors.contains_key("e0.0.conv.bias"));
    }
}
