// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use approx::assert_abs_diff_eq;
use ndarray::{Array2, Array3, s};
use std::f32::consts::PI;
use voxelhead_boxes::BoxCoder;
use voxelhead_head::{
    AveragePolicy, DetectorBuilder, HeadConfig, MultiTaskDetector, TaskPrediction, TaskTargets,
};

#[ctor::ctor]
fn init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

const CONFIG: &str = include_str!("../../../testdata/two_task_head.yaml");
const NUM_ANCHORS: usize = 4;

struct TaskData {
    prediction: TaskPrediction,
    targets: TaskTargets,
    anchors: Array3<f32>,
}

/// Anchors along x with a perfect prediction for every positive anchor.
/// `positives` lists `(sample, anchor, label, gt_box)`.
fn task_data(
    size: [f32; 3],
    channels: usize,
    background_channel: bool,
    positives: &[(usize, usize, i32, [f32; 7])],
    ignored: &[(usize, usize)],
) -> TaskData {
    let anchors = Array3::from_shape_fn((2, NUM_ANCHORS, 7), |(_, m, c)| match c {
        0 => 5.0 + 10.0 * m as f32,
        2 => -1.0,
        3..=5 => size[c - 3],
        _ => 0.0,
    });
    let mut labels = Array2::zeros((2, NUM_ANCHORS));
    let mut reg_targets = Array3::zeros((2, NUM_ANCHORS, 7));
    let mut cls_preds = Array3::from_elem((2, NUM_ANCHORS, channels), -6.0);
    if background_channel {
        cls_preds.slice_mut(s![.., .., 0]).fill(6.0);
    }
    let mut dir_cls_preds = Array3::zeros((2, NUM_ANCHORS, 2));

    let coder = BoxCoder::default();
    for &(b, m, label, gt) in positives {
        let gt = Array2::from_shape_vec((1, 7), gt.to_vec()).unwrap();
        let anchor = anchors.slice(s![b, m..m + 1, ..]);
        let code = coder.encode(gt.view(), anchor).unwrap();
        reg_targets.slice_mut(s![b, m, ..]).assign(&code.row(0));
        labels[[b, m]] = label;

        let channel = if background_channel {
            label as usize
        } else {
            label as usize - 1
        };
        cls_preds.slice_mut(s![b, m, ..]).fill(-6.0);
        cls_preds[[b, m, channel]] = 6.0;
        let bin = usize::from(gt[[0, 6]] > 0.0);
        dir_cls_preds[[b, m, bin]] = 3.0;
        dir_cls_preds[[b, m, 1 - bin]] = -3.0;
    }
    for &(b, m) in ignored {
        labels[[b, m]] = -1;
    }

    TaskData {
        prediction: TaskPrediction::WithDirection {
            box_preds: reg_targets.clone(),
            cls_preds,
            dir_cls_preds,
        },
        targets: TaskTargets {
            labels,
            reg_targets,
        },
        anchors,
    }
}

const CAR_0: [f32; 7] = [5.3, 0.2, -0.9, 4.1, 1.7, 1.5, 0.3];
const CAR_1: [f32; 7] = [25.1, -0.1, -1.0, 3.8, 1.6, 1.5, -0.4];
const CYCLIST_0: [f32; 7] = [15.2, 0.3, -0.8, 1.7, 0.6, 1.7, 1.2];
const PEDESTRIAN_1: [f32; 7] = [34.8, -0.2, -0.9, 0.8, 0.6, 1.8, -2.0];

fn scene() -> Vec<TaskData> {
    vec![
        task_data(
            [3.9, 1.6, 1.56],
            1,
            false,
            &[(0, 0, 1, CAR_0), (1, 2, 1, CAR_1)],
            &[(0, 3)],
        ),
        task_data(
            [0.8, 0.6, 1.73],
            3,
            true,
            &[(0, 1, 2, CYCLIST_0), (1, 3, 1, PEDESTRIAN_1)],
            &[(1, 0)],
        ),
    ]
}

fn detector() -> MultiTaskDetector {
    DetectorBuilder::new()
        .with_config_yaml_str(CONFIG.to_string())
        .build()
        .unwrap()
}

fn assert_box_eq(actual: [f32; 7], expected: [f32; 7]) {
    for (a, e) in actual.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*a, *e, epsilon = 1e-4);
    }
}

#[test]
fn test_training_losses() {
    let detector = detector();
    let scene = scene();
    let predictions: Vec<_> = scene.iter().map(|t| t.prediction.clone()).collect();
    let targets: Vec<_> = scene.iter().map(|t| t.targets.clone()).collect();
    let anchors: Vec<_> = scene.iter().map(|t| t.anchors.clone()).collect();

    let records = detector
        .compute_loss(&predictions, &targets, &anchors)
        .unwrap();
    assert_eq!(records.len(), 2);
    for (record, task) in records.iter().zip(&scene) {
        assert!(record.loss.is_finite());
        // box predictions equal their targets
        assert!(record.loc_loss_reduced.abs() < 1e-6);
        assert!(record.cls_loss_reduced > 0.0);
        let dir = record.dir_loss_reduced.unwrap();
        assert!(dir > 0.0 && dir < 0.01);
        assert_abs_diff_eq!(
            record.loss,
            record.cls_loss_reduced + record.loc_loss_reduced + dir,
            epsilon = 1e-6
        );
        assert_eq!(record.cared, task.targets.labels.mapv(|l| l >= 0));
    }
    assert_eq!(records[0].cls_loss.dim(), (2, NUM_ANCHORS, 1));
    assert_eq!(records[1].cls_loss.dim(), (2, NUM_ANCHORS, 3));

    let mut metrics = detector.metrics(AveragePolicy::Simple);
    for (task_id, (record, task)) in records.iter().zip(&scene).enumerate() {
        let batch = detector
            .metrics_batch(task_id, record, task.targets.labels.view())
            .unwrap();
        let snapshot = metrics.update(batch).unwrap();
        assert_abs_diff_eq!(snapshot.rpn_acc, 1.0);
        assert_abs_diff_eq!(snapshot.pr["prec@50"], 1.0);
        assert_abs_diff_eq!(snapshot.pr["rec@95"], 1.0);
    }
}

#[test]
fn test_inference_merges_tasks() {
    let detector = detector();
    let scene = scene();
    let predictions: Vec<_> = scene.iter().map(|t| t.prediction.clone()).collect();
    let anchors: Vec<_> = scene.iter().map(|t| t.anchors.clone()).collect();

    let samples = detector
        .post_process(&predictions, &anchors, &["frame-0", "frame-1"])
        .unwrap();
    assert_eq!(samples.len(), 2);

    assert_eq!(samples[0].metadata, "frame-0");
    assert_eq!(samples[0].labels(), vec![0, 2]);
    assert_box_eq(samples[0].boxes()[0].into(), CAR_0);
    assert_box_eq(samples[0].boxes()[1].into(), CYCLIST_0);

    assert_eq!(samples[1].metadata, "frame-1");
    assert_eq!(samples[1].labels(), vec![0, 1]);
    assert_box_eq(samples[1].boxes()[0].into(), CAR_1);
    assert_box_eq(samples[1].boxes()[1].into(), PEDESTRIAN_1);
    assert!(samples.iter().flat_map(|s| s.scores()).all(|s| s > 0.99));
}

#[test]
fn test_direction_bin_flips_heading() {
    let detector = detector();
    let mut scene = scene();
    if let TaskPrediction::WithDirection { dir_cls_preds, .. } = &mut scene[0].prediction {
        dir_cls_preds.slice_mut(s![0, 0, ..]).assign(&ndarray::arr1(&[3.0, -3.0]));
    }
    let predictions: Vec<_> = scene.iter().map(|t| t.prediction.clone()).collect();
    let anchors: Vec<_> = scene.iter().map(|t| t.anchors.clone()).collect();
    let samples = detector
        .post_process(&predictions, &anchors, &[(), ()])
        .unwrap();
    assert_abs_diff_eq!(samples[0].boxes()[0].heading, CAR_0[6] + PI, epsilon = 1e-5);
    assert_abs_diff_eq!(samples[1].boxes()[0].heading, CAR_1[6], epsilon = 1e-5);
}

#[test]
fn test_json_config_builds_same_detector() {
    let config: HeadConfig = serde_yaml::from_str(CONFIG).unwrap();
    let json = serde_json::to_string(&config).unwrap();
    let from_json = DetectorBuilder::new()
        .with_config_json_str(json)
        .build()
        .unwrap();
    assert_eq!(from_json, detector());
    let from_config = DetectorBuilder::new().with_config(config).build().unwrap();
    assert_eq!(from_config.class_counts(), vec![1, 2]);
}
