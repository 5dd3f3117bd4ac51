//! End-to-end experiment on a tiny synthetic 2-D segmentation problem
//!
//! Images are written as NIfTI volumes, labels are `image > 0.5` and the
//! model is a single 3x3 convolution with softmax.

use std::path::Path;

use node_toolkit::data::{write_nifti, DataSplit};
use node_toolkit::pipeline::{TrainingLog, BEST_MODEL, MODEL_CONFIG_FILE, SPLIT_FILE, TRAINING_LOG_FILE};
use node_toolkit::training::load_state;
use node_toolkit::{run_experiment, ExperimentConfig, Tensor};

const SIDE: usize = 6;

fn image(case: usize) -> Vec<f32> {
    (0..SIDE * SIDE)
        .map(|i| ((i * 7 + case * 5) % 13) as f32 / 12.0)
        .collect()
}

fn write_cases(dir: &Path, cases: std::ops::Range<usize>) {
    std::fs::create_dir_all(dir).unwrap();
    for case in cases {
        let pixels = image(case);
        let label: Vec<f32> = pixels.iter().map(|&v| if v > 0.5 { 1.0 } else { 0.0 }).collect();
        let img = Tensor::from_vec(&[1, SIDE, SIDE], pixels).unwrap();
        let lbl = Tensor::from_vec(&[1, SIDE, SIDE], label).unwrap();
        write_nifti(&dir.join(format!("case_{:03}_0000.nii.gz", case)), &img).unwrap();
        write_nifti(&dir.join(format!("case_{:03}_0001.nii", case)), &lbl).unwrap();
    }
}

fn config(root: &Path, epochs: usize) -> ExperimentConfig {
    let text = format!(
        r#"{{
        "seed": 11,
        "data": {{"train_dir": {train:?}, "val_dir": {val:?}, "save_dir": {out:?}}},
        "training": {{"batch_size": 2, "num_epochs": {epochs}, "learning_rate": 0.05, "weight_decay": 0.0,
                     "validation_interval": 1, "patience": 100, "drop_last": false}},
        "model": {{
            "sub_networks": {{
                "seg": {{
                    "node_configs": {{"0": [1, {s}, {s}], "1": [2, {s}, {s}]}},
                    "hyperedges": {{"e1": {{"src_nodes": [0], "dst_nodes": [1],
                                          "params": {{"convs": [[2, 1, 3, 3]], "acts": ["softmax"],
                                                      "feature_size": [{s}, {s}]}}}}}},
                    "in_nodes": [0], "out_nodes": [1], "num_dimensions": 2
                }},
                "label": {{"node_configs": {{"0": [2, {s}, {s}]}}, "in_nodes": [0], "out_nodes": [0],
                          "num_dimensions": 2}}
            }},
            "node_mapping": [[100, "seg", 0], [200, "seg", 1], [300, "label", 0]],
            "in_nodes": [100, 300], "out_nodes": [200, 300], "num_dimensions": 2
        }},
        "node_files": [[100, "0000"], [300, "0001"]],
        "transforms": {{"train": {{"300": [{{"type": "one_hot", "num_classes": 2}}]}},
                       "validate": {{"300": [{{"type": "one_hot", "num_classes": 2}}]}}}},
        "tasks": {{"seg": {{"loss": [{{"fn": "node_dice_loss", "src_node": 200, "target_node": 300}}],
                          "metric": [{{"fn": "node_dice_metric", "src_node": 200, "target_node": 300}},
                                     {{"fn": "node_recall_metric", "src_node": 200, "target_node": 300}}]}}}},
        "save_sub_networks": ["seg"]
    }}"#,
        train = root.join("train").to_string_lossy(),
        val = root.join("val").to_string_lossy(),
        out = root.join("out").to_string_lossy(),
        epochs = epochs,
        s = SIDE,
    );
    ExperimentConfig::from_json(&text).unwrap()
}

#[test]
fn test_experiment_writes_outputs_and_learns() {
    let root = tempfile::tempdir().unwrap();
    write_cases(&root.path().join("train"), 0..4);
    write_cases(&root.path().join("val"), 4..6);
    let config = config(root.path(), 12);

    let log = run_experiment(&config).unwrap();
    assert_eq!(log.epochs.len(), 12);
    assert!(!log.stopped_early);

    let first = log.epochs.first().unwrap().train_loss;
    let last = log.epochs.last().unwrap().train_loss;
    assert!(last < first, "train loss did not decrease: {} -> {}", first, last);
    assert!(log.epochs.iter().all(|e| e.val_loss.is_some()));

    let out = root.path().join("out");
    for file in [SPLIT_FILE, MODEL_CONFIG_FILE, TRAINING_LOG_FILE] {
        assert!(out.join(file).is_file(), "missing {}", file);
    }
    let best = load_state(&out.join(format!("{}.bin", BEST_MODEL))).unwrap();
    assert!(best.tensors.keys().all(|k| k.starts_with("seg.")));
    let seg = load_state(&out.join("seg.bin")).unwrap();
    assert!(seg.tensors.keys().any(|k| k.starts_with("e1.")));

    let split = DataSplit::load(&out.join(SPLIT_FILE)).unwrap();
    assert_eq!(split.train_count, 4);
    assert_eq!(split.val_case_ids, vec!["004", "005"]);

    let saved = TrainingLog::load(&out.join(TRAINING_LOG_FILE)).unwrap();
    assert_eq!(saved, log);
    let metrics = &log.epochs[0].train_task_metrics["seg"];
    assert_eq!(metrics.len(), 2);
    assert_eq!(metrics[0].result.per_class.len(), 2);
}

#[test]
fn test_pretrained_sub_network_is_loaded() {
    let root = tempfile::tempdir().unwrap();
    write_cases(&root.path().join("train"), 0..2);
    write_cases(&root.path().join("val"), 2..4);
    let first = config(root.path(), 2);
    run_experiment(&first).unwrap();

    let mut second = config(root.path(), 1);
    second.data.save_dir = root.path().join("finetune");
    second.pretrained.insert("seg".into(), root.path().join("out").join("seg.bin"));
    second.pretrained.insert("label".into(), root.path().join("missing.bin"));
    let log = run_experiment(&second).unwrap();
    assert_eq!(log.epochs.len(), 1);
    assert_eq!(log.best_epoch, Some(0));
}

#[test]
fn test_same_seed_same_run() {
    let root = tempfile::tempdir().unwrap();
    write_cases(&root.path().join("train"), 0..3);
    write_cases(&root.path().join("val"), 3..5);
    let mut a = config(root.path(), 2);
    a.data.save_dir = root.path().join("a");
    let mut b = config(root.path(), 2);
    b.data.save_dir = root.path().join("b");
    let log_a = run_experiment(&a).unwrap();
    let log_b = run_experiment(&b).unwrap();
    let losses = |log: &TrainingLog| log.epochs.iter().map(|e| e.train_loss).collect::<Vec<_>>();
    assert_eq!(losses(&log_a), losses(&log_b));
}

#[test]
fn test_stalled_validation_stops_early() {
    let root = tempfile::tempdir().unwrap();
    write_cases(&root.path().join("train"), 0..2);
    write_cases(&root.path().join("val"), 2..4);
    let mut config = config(root.path(), 6);
    // too small to move any weight, so the validation loss never improves
    config.training.learning_rate = 1e-30;
    config.training.patience = 1;

    let log = run_experiment(&config).unwrap();
    assert!(log.stopped_early);
    assert_eq!(log.epochs.len(), 2);
    assert_eq!(log.best_epoch, Some(0));
    assert_eq!(log.epochs[0].val_loss, log.epochs[1].val_loss);
}
