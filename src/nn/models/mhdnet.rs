use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, info};

use super::{HDNet, MHDNetConfig, NodeId};
use crate::error::{NodeError, NodeResult};
use crate::nn::layers::{ModelState, Module, Parameter};
use crate::tensor::Tensor;

/// How one sub-network is wired to the global nodes.
#[derive(Debug, Clone, Default)]
struct Wiring {
    /// Global feeding each local input, in the sub-network's `in_nodes` order.
    inputs: Vec<NodeId>,
    /// Globals written by each local output, in `out_nodes` order. Empty for
    /// pass-through outputs and unmapped outputs.
    outputs: Vec<Vec<NodeId>>,
}

/// Several [`HDNet`]s joined through shared global nodes.
///
/// A global node is either a model input or the sum of every sub-network
/// output mapped onto it. A sub-network output that is also one of its own
/// inputs is a pass-through and produces nothing.
#[derive(Debug, Clone)]
pub struct MHDNet {
    config: MHDNetConfig,
    sub_networks: BTreeMap<String, HDNet>,
    wiring: BTreeMap<String, Wiring>,
    order: Vec<String>,
    batch: Option<usize>,
}

impl MHDNet {
    /// Builds every sub-network, seeding weight initialisation with `seed`.
    pub fn new(config: MHDNetConfig, seed: u64) -> NodeResult<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut sub_networks = BTreeMap::new();
        for (name, sub_config) in &config.sub_networks {
            if sub_config.num_dimensions != config.num_dimensions {
                return Err(NodeError::InvalidConfig(format!(
                    "sub-network {} has {} spatial dims, the model has {}",
                    name, sub_config.num_dimensions, config.num_dimensions
                )));
            }
            let net = HDNet::new(sub_config.clone(), &mut rng)
                .map_err(|e| annotate(e, name))?;
            sub_networks.insert(name.clone(), net);
        }
        let wiring = build_wiring(&config)?;
        let order = subnet_order(&config, &wiring)?;
        debug!(order = ?order, "sub-network execution order");
        Ok(Self {
            config,
            sub_networks,
            wiring,
            order,
            batch: None,
        })
    }

    pub fn config(&self) -> &MHDNetConfig {
        &self.config
    }

    pub fn in_nodes(&self) -> &[NodeId] {
        &self.config.in_nodes
    }

    pub fn out_nodes(&self) -> &[NodeId] {
        &self.config.out_nodes
    }

    pub fn sub_network(&self, name: &str) -> Option<&HDNet> {
        self.sub_networks.get(name)
    }

    pub fn sub_network_names(&self) -> Vec<&str> {
        self.sub_networks.keys().map(|s| s.as_str()).collect()
    }

    /// Sub-network names in execution order.
    pub fn execution_order(&self) -> &[String] {
        &self.order
    }

    /// Shape `(C, S...)` of a global node.
    pub fn node_shape(&self, global: &str) -> Option<&[usize]> {
        self.config.global_shape(global).map(|s| s.as_slice())
    }

    /// Runs every sub-network. `inputs` follow `in_nodes`; outputs follow
    /// `out_nodes`.
    pub fn forward(&mut self, inputs: &[Tensor]) -> NodeResult<Vec<Tensor>> {
        if inputs.len() != self.config.in_nodes.len() {
            return Err(NodeError::InvalidData(format!(
                "expected {} inputs, got {}",
                self.config.in_nodes.len(),
                inputs.len()
            )));
        }
        let batch = inputs.first().map_or(1, |t| t.shape().batch());
        let mut values: BTreeMap<NodeId, Tensor> = self
            .config
            .in_nodes
            .iter()
            .cloned()
            .zip(inputs.iter().cloned())
            .collect();

        for name in &self.order {
            let wiring = &self.wiring[name];
            let local_inputs = wiring
                .inputs
                .iter()
                .map(|g| {
                    values
                        .get(g)
                        .cloned()
                        .ok_or_else(|| NodeError::GraphError(format!("global node {} has no value", g)))
                })
                .collect::<NodeResult<Vec<_>>>()?;
            let net = self
                .sub_networks
                .get_mut(name)
                .ok_or_else(|| NodeError::GraphError(format!("unknown sub-network {}", name)))?;
            let outputs = net.forward(&local_inputs).map_err(|e| annotate(e, name))?;
            for (globals, output) in wiring.outputs.iter().zip(outputs) {
                for global in globals {
                    match values.get_mut(global) {
                        Some(existing) => existing.add_assign(&output)?,
                        None => {
                            values.insert(global.clone(), output.clone());
                        }
                    }
                }
            }
        }

        self.batch = Some(batch);
        self.config
            .out_nodes
            .iter()
            .map(|g| {
                values
                    .get(g)
                    .cloned()
                    .ok_or_else(|| NodeError::GraphError(format!("output node {} has no value", g)))
            })
            .collect()
    }

    /// Back-propagates output gradients and returns the gradients of the
    /// global inputs in `in_nodes` order.
    pub fn backward(&mut self, grad_outputs: &[Option<Tensor>]) -> NodeResult<Vec<Tensor>> {
        let batch = self
            .batch
            .take()
            .ok_or_else(|| NodeError::operation_error("mhdnet_backward", "backward called before forward"))?;
        if grad_outputs.len() != self.config.out_nodes.len() {
            return Err(NodeError::InvalidData(format!(
                "expected {} output gradients, got {}",
                self.config.out_nodes.len(),
                grad_outputs.len()
            )));
        }
        let mut grads: BTreeMap<NodeId, Tensor> = BTreeMap::new();
        for (global, grad) in self.config.out_nodes.iter().zip(grad_outputs) {
            if let Some(grad) = grad {
                add_grad(&mut grads, global, grad)?;
            }
        }

        for name in self.order.iter().rev() {
            let wiring = &self.wiring[name];
            let mut local_grads = Vec::with_capacity(wiring.outputs.len());
            for globals in &wiring.outputs {
                let mut total: Option<Tensor> = None;
                for global in globals {
                    if let Some(g) = grads.get(global) {
                        total = Some(match total.take() {
                            Some(mut t) => {
                                t.add_assign(g)?;
                                t
                            }
                            None => g.clone(),
                        });
                    }
                }
                local_grads.push(total);
            }
            if local_grads.iter().all(Option::is_none) {
                continue;
            }
            let net = self
                .sub_networks
                .get_mut(name)
                .ok_or_else(|| NodeError::GraphError(format!("unknown sub-network {}", name)))?;
            let input_grads = net.backward(&local_grads).map_err(|e| annotate(e, name))?;
            for (global, grad) in wiring.inputs.iter().zip(input_grads) {
                add_grad(&mut grads, global, &grad)?;
            }
        }

        self.config
            .in_nodes
            .iter()
            .map(|g| match grads.remove(g) {
                Some(t) => Ok(t),
                None => {
                    let shape = self
                        .config
                        .global_shape(g)
                        .ok_or_else(|| NodeError::GraphError(format!("global node {} is unmapped", g)))?;
                    let mut dims = vec![batch];
                    dims.extend_from_slice(shape);
                    Ok(Tensor::zeros(&dims))
                }
            })
            .collect()
    }

    /// Weights of one sub-network, named without the sub-network prefix.
    pub fn sub_network_state(&mut self, name: &str) -> NodeResult<ModelState> {
        self.sub_networks
            .get_mut(name)
            .map(|net| net.state_dict())
            .ok_or_else(|| NodeError::unknown_symbol("sub-network", name))
    }

    /// Loads pretrained weights into one sub-network.
    pub fn load_sub_network_state(&mut self, name: &str, state: &ModelState) -> NodeResult<usize> {
        let net = self
            .sub_networks
            .get_mut(name)
            .ok_or_else(|| NodeError::unknown_symbol("sub-network", name))?;
        let loaded = net.load_state_dict(state, true)?;
        info!(sub_network = name, tensors = loaded, "loaded sub-network weights");
        Ok(loaded)
    }
}

fn annotate(err: NodeError, subnet: &str) -> NodeError {
    match err {
        NodeError::GraphError(msg) => NodeError::GraphError(format!("sub-network {}: {}", subnet, msg)),
        NodeError::InvalidConfig(msg) => NodeError::InvalidConfig(format!("sub-network {}: {}", subnet, msg)),
        other => other,
    }
}

fn add_grad(grads: &mut BTreeMap<NodeId, Tensor>, node: &str, grad: &Tensor) -> NodeResult<()> {
    match grads.get_mut(node) {
        Some(existing) => existing.add_assign(grad),
        None => {
            grads.insert(node.to_string(), grad.clone());
            Ok(())
        }
    }
}

fn build_wiring(config: &MHDNetConfig) -> NodeResult<BTreeMap<String, Wiring>> {
    for m in &config.node_mapping {
        let sub = config.sub_networks.get(&m.subnet).ok_or_else(|| {
            NodeError::GraphError(format!("mapping of {} names unknown sub-network {}", m.global, m.subnet))
        })?;
        if !sub.node_configs.contains_key(&m.local) {
            return Err(NodeError::GraphError(format!(
                "mapping of {} names unknown node {} in sub-network {}",
                m.global, m.local, m.subnet
            )));
        }
    }

    // every local view of a global must agree on its shape
    let mut shapes: BTreeMap<&str, &Vec<usize>> = BTreeMap::new();
    for m in &config.node_mapping {
        let shape = &config.sub_networks[&m.subnet].node_configs[&m.local];
        if let Some(previous) = shapes.insert(m.global.as_str(), shape) {
            if previous != shape {
                return Err(NodeError::shape_error(
                    &format!("{:?}", previous),
                    &format!("{:?}", shape),
                    Some(&format!("global node {} is mapped to nodes of different shapes", m.global)),
                ));
            }
        }
    }

    let mut wiring = BTreeMap::new();
    let mut produced = BTreeSet::new();
    for (name, sub) in &config.sub_networks {
        let mappings = |local: &NodeId| -> Vec<NodeId> {
            config
                .node_mapping
                .iter()
                .filter(|m| &m.subnet == name && &m.local == local)
                .map(|m| m.global.clone())
                .collect()
        };
        let mut w = Wiring::default();
        for local in &sub.in_nodes {
            let globals = mappings(local);
            match globals.as_slice() {
                [global] => w.inputs.push(global.clone()),
                [] => {
                    return Err(NodeError::GraphError(format!(
                        "input node {} of sub-network {} is not mapped to a global node",
                        local, name
                    )))
                }
                _ => {
                    return Err(NodeError::GraphError(format!(
                        "input node {} of sub-network {} is mapped to several global nodes",
                        local, name
                    )))
                }
            }
        }
        for local in &sub.out_nodes {
            if sub.in_nodes.contains(local) {
                w.outputs.push(Vec::new());
                continue;
            }
            let globals = mappings(local);
            produced.extend(globals.iter().cloned());
            w.outputs.push(globals);
        }
        wiring.insert(name.clone(), w);
    }

    for global in &config.in_nodes {
        if produced.contains(global) {
            return Err(NodeError::GraphError(format!(
                "global node {} is both a model input and a sub-network output",
                global
            )));
        }
        if config.global_shape(global).is_none() {
            return Err(NodeError::GraphError(format!("global input {} is not mapped", global)));
        }
    }
    let available = |g: &NodeId| config.in_nodes.contains(g) || produced.contains(g);
    for global in &config.out_nodes {
        if !available(global) {
            return Err(NodeError::GraphError(format!("global output {} is never produced", global)));
        }
    }
    for (name, w) in &wiring {
        if let Some(g) = w.inputs.iter().find(|g| !available(*g)) {
            return Err(NodeError::GraphError(format!(
                "sub-network {} reads global node {} which is neither an input nor produced",
                name, g
            )));
        }
    }
    Ok(wiring)
}

/// Producers of a global node run before the sub-networks that read it.
fn subnet_order(config: &MHDNetConfig, wiring: &BTreeMap<String, Wiring>) -> NodeResult<Vec<String>> {
    let mut graph = DiGraph::<&str, ()>::new();
    let indices: BTreeMap<&str, _> = config
        .sub_networks
        .keys()
        .map(|name| (name.as_str(), graph.add_node(name.as_str())))
        .collect();
    for (producer, pw) in wiring {
        let writes: BTreeSet<&NodeId> = pw.outputs.iter().flatten().collect();
        for (consumer, cw) in wiring {
            if cw.inputs.iter().any(|g| writes.contains(g)) {
                graph.add_edge(indices[producer.as_str()], indices[consumer.as_str()], ());
            }
        }
    }
    toposort(&graph, None)
        .map(|order| order.into_iter().map(|idx| graph[idx].to_string()).collect())
        .map_err(|cycle| {
            NodeError::GraphError(format!("sub-networks form a cycle through {}", graph[cycle.node_id()]))
        })
}

impl Module for MHDNet {
    fn visit_parameters(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Parameter)) {
        for (name, net) in &mut self.sub_networks {
            net.visit_parameters(&crate::nn::layers::join_name(prefix, name), f);
        }
    }

    fn visit_buffers(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Tensor)) {
        for (name, net) in &mut self.sub_networks {
            net.visit_buffers(&crate::nn::layers::join_name(prefix, name), f);
        }
    }

    fn set_training(&mut self, training: bool) {
        for net in self.sub_networks.values_mut() {
            net.set_training(training);
        }
    }
}
