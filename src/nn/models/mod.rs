//! Hypergraph models: the per-edge conv block [`DNet`], single hypergraphs
//! [`HDNet`] and multi-hypergraph compositions [`MHDNet`].

mod dnet;
mod hdnet;
mod mhdnet;

pub use dnet::DNet;
pub use hdnet::HDNet;
pub use mhdnet::MHDNet;

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::nn::layers::{Activation, NormKind};
use crate::tensor::Interpolation;

/// Node identifier. Configuration files may spell ids as strings or integers.
pub type NodeId = String;

/// A node id as written in a configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawNodeId {
    Text(String),
    Number(i64),
}

impl From<RawNodeId> for NodeId {
    fn from(raw: RawNodeId) -> Self {
        match raw {
            RawNodeId::Text(s) => s,
            RawNodeId::Number(n) => n.to_string(),
        }
    }
}

pub(crate) fn de_node_ids<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<NodeId>, D::Error> {
    Vec::<RawNodeId>::deserialize(d).map(|ids| ids.into_iter().map(NodeId::from).collect())
}

pub(crate) fn de_node_id<'de, D: Deserializer<'de>>(d: D) -> Result<NodeId, D::Error> {
    RawNodeId::deserialize(d).map(NodeId::from)
}

/// How a hyperedge builds one convolution weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConvSpec {
    /// `[out, in, k...]`, initialised randomly.
    Shape(Vec<usize>),
    /// Channel-preserving pass-through, `{"identity": channels}`.
    Identity { identity: usize },
    /// Fixed weights, `{"shape": [...], "values": [...]}`.
    Values { shape: Vec<usize>, values: Vec<f32> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperedgeParams {
    pub convs: Vec<ConvSpec>,
    /// Trainability per conv; empty means every conv trains.
    #[serde(default)]
    pub reqs: Vec<bool>,
    #[serde(default)]
    pub norms: Vec<Option<NormKind>>,
    #[serde(default)]
    pub acts: Vec<Option<Activation>>,
    /// Dropout probability applied after every block.
    #[serde(default)]
    pub dropout: Option<f32>,
    pub feature_size: Vec<usize>,
    #[serde(default)]
    pub intp: Interpolation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperedgeConfig {
    #[serde(deserialize_with = "de_node_ids")]
    pub src_nodes: Vec<NodeId>,
    #[serde(deserialize_with = "de_node_ids")]
    pub dst_nodes: Vec<NodeId>,
    pub params: HyperedgeParams,
}

/// One hypergraph: node shapes `(C, S...)`, hyperedges and its interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HDNetConfig {
    pub node_configs: BTreeMap<NodeId, Vec<usize>>,
    #[serde(default)]
    pub hyperedges: BTreeMap<String, HyperedgeConfig>,
    #[serde(deserialize_with = "de_node_ids")]
    pub in_nodes: Vec<NodeId>,
    #[serde(deserialize_with = "de_node_ids")]
    pub out_nodes: Vec<NodeId>,
    #[serde(default = "default_dimensions")]
    pub num_dimensions: usize,
}

fn default_dimensions() -> usize {
    3
}

/// `(global node, sub-network, local node)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(RawNodeId, String, RawNodeId)", into = "(NodeId, String, NodeId)")]
pub struct NodeMapping {
    pub global: NodeId,
    pub subnet: String,
    pub local: NodeId,
}

impl From<(RawNodeId, String, RawNodeId)> for NodeMapping {
    fn from((global, subnet, local): (RawNodeId, String, RawNodeId)) -> Self {
        Self {
            global: global.into(),
            subnet,
            local: local.into(),
        }
    }
}

impl From<NodeMapping> for (NodeId, String, NodeId) {
    fn from(m: NodeMapping) -> Self {
        (m.global, m.subnet, m.local)
    }
}

impl NodeMapping {
    pub fn new(global: &str, subnet: &str, local: &str) -> Self {
        Self {
            global: global.to_string(),
            subnet: subnet.to_string(),
            local: local.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MHDNetConfig {
    pub sub_networks: BTreeMap<String, HDNetConfig>,
    pub node_mapping: Vec<NodeMapping>,
    #[serde(deserialize_with = "de_node_ids")]
    pub in_nodes: Vec<NodeId>,
    #[serde(deserialize_with = "de_node_ids")]
    pub out_nodes: Vec<NodeId>,
    #[serde(default = "default_dimensions")]
    pub num_dimensions: usize,
}

impl MHDNetConfig {
    /// Shape `(C, S...)` of a global node, taken from its first mapping.
    pub fn global_shape(&self, global: &str) -> Option<&Vec<usize>> {
        self.node_mapping
            .iter()
            .filter(|m| m.global == global)
            .find_map(|m| self.sub_networks.get(&m.subnet)?.node_configs.get(&m.local))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_accepts_integer_node_ids() {
        let json = r#"{
            "node_configs": {"0": [1, 8, 8], "1": [2, 8, 8]},
            "hyperedges": {
                "e1": {"src_nodes": [0], "dst_nodes": [1], "params": {
                    "convs": [[2, 1, 3, 3], {"identity": 2}],
                    "reqs": [true, false],
                    "norms": ["batch", null],
                    "acts": ["leakyrelu", null],
                    "feature_size": [8, 8],
                    "intp": "max"
                }}
            },
            "in_nodes": [0],
            "out_nodes": [1],
            "num_dimensions": 2
        }"#;
        let config: HDNetConfig = serde_json::from_str(json).unwrap();
        let edge = &config.hyperedges["e1"];
        assert_eq!(edge.src_nodes, vec!["0".to_string()]);
        assert_eq!(edge.params.convs[1], ConvSpec::Identity { identity: 2 });
        assert_eq!(edge.params.norms[0], Some(NormKind::Batch));
        assert_eq!(edge.params.intp, Interpolation::Max);
    }

    #[test]
    fn test_node_mapping_tuple_form() {
        let mapping: Vec<NodeMapping> = serde_json::from_str(r#"[[100, "seg", 0], ["n5", "cls", "n1"]]"#).unwrap();
        assert_eq!(mapping[0], NodeMapping::new("100", "seg", "0"));
        assert_eq!(mapping[1].local, "n1");
        let back = serde_json::to_string(&mapping[0]).unwrap();
        assert_eq!(back, r#"["100","seg","0"]"#);
    }
}
