//! Tests for the crate-level surface
//!
//! Every exported name is reachable from the crate root, resolves through
//! the registry to the same item, and unknown names fail with
//! `UnknownSymbol`.

use node_toolkit::registry::{self, Item};
use node_toolkit::{
    node_dice_loss, node_dice_metric, node_f1_metric, node_focal_loss, node_iou_loss, node_iou_metric, node_lp_loss,
    node_precision_metric, node_recall_metric, train, validate, DNet, HDNet, MHDNet, MinMaxNormalize, NodeDataset,
    NodeError, RandomFlip, RandomMask, RandomRotate, RandomShift, RandomZoom, Tensor, ZScoreNormalize,
};

const EXPORTED: [&str; 22] = [
    "NodeDataset",
    "MinMaxNormalize",
    "ZScoreNormalize",
    "RandomRotate",
    "RandomFlip",
    "RandomShift",
    "RandomZoom",
    "RandomMask",
    "node_lp_loss",
    "node_focal_loss",
    "node_dice_loss",
    "node_iou_loss",
    "node_recall_metric",
    "node_precision_metric",
    "node_f1_metric",
    "node_dice_metric",
    "node_iou_metric",
    "DNet",
    "HDNet",
    "MHDNet",
    "train",
    "validate",
];

#[test]
fn test_exported_order_is_stable() {
    let names: Vec<&str> = registry::exported_symbols().iter().map(|s| s.name).collect();
    assert_eq!(names, EXPORTED);
    let again: Vec<&str> = registry::exported_symbols().iter().map(|s| s.name).collect();
    assert_eq!(names, again);
}

#[test]
fn test_registry_items_are_the_root_items() {
    let losses = [
        ("node_lp_loss", node_lp_loss as usize),
        ("node_focal_loss", node_focal_loss as usize),
        ("node_dice_loss", node_dice_loss as usize),
        ("node_iou_loss", node_iou_loss as usize),
    ];
    for (name, f) in losses {
        assert_eq!(registry::resolve_loss(name).unwrap() as usize, f, "{}", name);
    }
    let metrics = [
        ("node_recall_metric", node_recall_metric as usize),
        ("node_precision_metric", node_precision_metric as usize),
        ("node_f1_metric", node_f1_metric as usize),
        ("node_dice_metric", node_dice_metric as usize),
        ("node_iou_metric", node_iou_metric as usize),
    ];
    for (name, f) in metrics {
        assert_eq!(registry::resolve_metric(name).unwrap() as usize, f, "{}", name);
    }
    assert_eq!(registry::resolve_train("train").unwrap() as usize, train as usize);
    assert_eq!(registry::resolve_validate("validate").unwrap() as usize, validate as usize);
}

#[test]
fn test_type_symbols_name_their_module() {
    for name in ["DNet", "HDNet", "MHDNet"] {
        let symbol = registry::resolve(name).unwrap();
        assert!(matches!(symbol.item, Item::Type));
        assert_eq!(symbol.module, "nn::models");
    }
    assert_eq!(registry::resolve("NodeDataset").unwrap().module, "data::dataset");
}

#[test]
fn test_unknown_symbol() {
    match registry::resolve("node_hausdorff_metric") {
        Err(NodeError::UnknownSymbol { kind, name }) => {
            assert_eq!(kind, "symbol");
            assert_eq!(name, "node_hausdorff_metric");
        }
        other => panic!("expected UnknownSymbol, got {:?}", other),
    }
    assert!(matches!(
        registry::resolve_metric("node_dice_loss"),
        Err(NodeError::UnknownSymbol { .. })
    ));
}

#[test]
fn test_root_types_are_usable() {
    let _types: (
        Option<NodeDataset>,
        Option<DNet>,
        Option<HDNet>,
        MinMaxNormalize,
        ZScoreNormalize,
        RandomRotate,
        RandomFlip,
        RandomShift,
        RandomZoom,
        RandomMask,
    ) = (
        None,
        None,
        None,
        MinMaxNormalize,
        ZScoreNormalize,
        RandomRotate::new(15.0),
        RandomFlip::default(),
        RandomShift { max_shift: 2 },
        RandomZoom::new(0.9, 1.1),
        RandomMask::default(),
    );

    let model: MHDNet = serde_json::from_str::<node_toolkit::nn::MHDNetConfig>(
        r#"{
            "sub_networks": {"a": {"node_configs": {"0": [1, 4], "1": [1, 4]},
                                   "hyperedges": {"e": {"src_nodes": [0], "dst_nodes": [1],
                                                        "params": {"convs": [[1, 1, 3]], "feature_size": [4]}}},
                                   "in_nodes": [0], "out_nodes": [1], "num_dimensions": 1}},
            "node_mapping": [[10, "a", 0], [11, "a", 1]],
            "in_nodes": [10], "out_nodes": [11], "num_dimensions": 1
        }"#,
    )
    .map_err(NodeError::from)
    .and_then(|config| MHDNet::new(config, 3))
    .unwrap();
    assert_eq!(model.out_nodes().to_vec(), vec!["11".to_string()]);

    let x = Tensor::full(&[2, 1, 4], 0.5);
    let mut model = model;
    let out = model.forward(&[x]).unwrap();
    assert_eq!(out[0].dims(), &[2, 1, 4]);
}
