// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use std::f32::consts::PI;

use log::debug;
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayView3, Axis, s};
use ndarray_stats::QuantileExt;
use rayon::prelude::*;
use voxelhead_boxes::{BevBox, BoundingBox3d, BoxCoder, NmsKind, VELOCITY_INDEX, nms};

use crate::{
    Error, Result,
    config::{HeadConfig, NmsThresholds},
    losses::{sigmoid, softmax_inplace},
};

/// One decoded object.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DetectBox3d {
    pub bbox: BoundingBox3d,
    /// `[vx, vy]` when the box coder regresses velocity
    pub velocity: Option<[f32; 2]>,
    pub score: f32,
    pub label: usize,
}

/// Detections of one input sample together with its pass-through metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleDetections<M> {
    pub detections: Vec<DetectBox3d>,
    pub metadata: M,
}

impl<M> SampleDetections<M> {
    pub fn boxes(&self) -> Vec<BoundingBox3d> {
        self.detections.iter().map(|d| d.bbox).collect()
    }

    pub fn scores(&self) -> Vec<f32> {
        self.detections.iter().map(|d| d.score).collect()
    }

    pub fn labels(&self) -> Vec<usize> {
        self.detections.iter().map(|d| d.label).collect()
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

/// Candidate surviving NMS: anchor row, task-local class and score.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    anchor: usize,
    label: usize,
    score: f32,
}

/// Decodes one task's raw predictions and reduces them to detections.
#[derive(Debug, Clone, PartialEq)]
pub struct PostProcessor {
    pub box_coder: BoxCoder,
    pub num_classes: usize,
    pub encode_background_as_zeros: bool,
    pub use_sigmoid_score: bool,
    pub nms: NmsKind,
    /// Shared thresholds of the single-pass NMS.
    pub thresholds: NmsThresholds,
    /// Per-class thresholds, set when NMS runs separately for every class.
    pub class_thresholds: Option<Vec<NmsThresholds>>,
    pub post_center_range: Option<[f32; 6]>,
    /// Offset of the direction bins, `None` without a direction classifier.
    pub direction_offset: Option<f32>,
}

impl PostProcessor {
    pub fn from_config(config: &HeadConfig, task_id: usize) -> Result<Self> {
        let task = config.tasks.get(task_id).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "Task {task_id} requested but config has {} tasks",
                config.tasks.len()
            ))
        })?;
        let post = &config.post_process;
        let class_thresholds = post.use_multi_class_nms.then(|| {
            if task.class_nms.is_empty() {
                vec![post.thresholds(); task.num_classes]
            } else {
                task.class_nms.clone()
            }
        });
        Ok(Self {
            box_coder: config.box_coder,
            num_classes: task.num_classes,
            encode_background_as_zeros: config.encode_background_as_zeros(task_id),
            use_sigmoid_score: config.loss.use_sigmoid_score,
            nms: post.nms,
            thresholds: post.thresholds(),
            class_thresholds,
            post_center_range: post.post_center_limit_range,
            direction_offset: config
                .direction
                .use_direction_classifier
                .then_some(config.direction.direction_offset),
        })
    }

    fn num_cls_channels(&self) -> usize {
        if self.encode_background_as_zeros {
            self.num_classes
        } else {
            self.num_classes + 1
        }
    }

    /// Turns `[batch, anchors, _]` predictions into one detection list per
    /// sample. Task-local labels run from 0 to `num_classes - 1`.
    pub fn process(
        &self,
        box_preds: ArrayView3<f32>,
        cls_preds: ArrayView3<f32>,
        dir_cls_preds: Option<ArrayView3<f32>>,
        anchors: ArrayView3<f32>,
    ) -> Result<Vec<Vec<DetectBox3d>>> {
        self.check_shapes(box_preds, cls_preds, dir_cls_preds, anchors)?;
        let boxes = self.box_coder.decode_batch(box_preds, anchors)?;

        let mut samples = Vec::with_capacity(boxes.dim().0);
        for (b, sample_boxes) in boxes.outer_iter().enumerate() {
            let scores = self.scores(cls_preds.index_axis(Axis(0), b));
            let dir_labels = dir_cls_preds.map(|dir| direction_labels(dir.index_axis(Axis(0), b)));
            let detections = self.filter_decoded(
                sample_boxes,
                scores.view(),
                dir_labels.as_deref(),
            )?;
            debug!("sample {b}: {} detections", detections.len());
            samples.push(detections);
        }
        Ok(samples)
    }

    fn check_shapes(
        &self,
        box_preds: ArrayView3<f32>,
        cls_preds: ArrayView3<f32>,
        dir_cls_preds: Option<ArrayView3<f32>>,
        anchors: ArrayView3<f32>,
    ) -> Result<()> {
        let (batch, num_anchors, _) = box_preds.dim();
        if anchors.dim().0 != batch || anchors.dim().1 != num_anchors {
            return Err(Error::InvalidShape(format!(
                "anchors have shape {:?} for box_preds of shape {:?}",
                anchors.dim(),
                box_preds.dim()
            )));
        }
        if cls_preds.dim() != (batch, num_anchors, self.num_cls_channels()) {
            return Err(Error::InvalidShape(format!(
                "cls_preds have shape {:?}, expected ({batch}, {num_anchors}, {})",
                cls_preds.dim(),
                self.num_cls_channels()
            )));
        }
        match (self.direction_offset, dir_cls_preds) {
            (Some(_), Some(dir)) if dir.dim() != (batch, num_anchors, 2) => {
                Err(Error::InvalidShape(format!(
                    "dir_cls_preds have shape {:?}, expected ({batch}, {num_anchors}, 2)",
                    dir.dim()
                )))
            }
            (Some(_), None) => Err(Error::InvalidShape(
                "direction classifier enabled but no dir_cls_preds given".to_string(),
            )),
            (None, Some(_)) => Err(Error::InvalidShape(
                "dir_cls_preds given but direction classifier disabled".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Per-class foreground scores `[anchors, num_classes]`.
    pub fn scores(&self, cls_preds: ArrayView2<f32>) -> Array2<f32> {
        let mut scores = cls_preds.to_owned();
        if self.use_sigmoid_score {
            scores.mapv_inplace(sigmoid);
        } else {
            for row in scores.rows_mut() {
                softmax_inplace(row);
            }
        }
        if self.encode_background_as_zeros {
            scores
        } else {
            scores.slice(s![.., 1..]).to_owned()
        }
    }

    /// Thresholds, NMS, center-range filtering and direction correction of
    /// already decoded `[anchors, code]` boxes with `[anchors, num_classes]`
    /// scores. Detections are returned best first (per class in multi-class
    /// mode).
    pub fn filter_decoded(
        &self,
        boxes: ArrayView2<f32>,
        scores: ArrayView2<f32>,
        dir_labels: Option<&[usize]>,
    ) -> Result<Vec<DetectBox3d>> {
        if scores.nrows() != boxes.nrows() || scores.ncols() != self.num_classes {
            return Err(Error::InvalidShape(format!(
                "scores have shape {:?} for {} boxes and {} classes",
                scores.dim(),
                boxes.nrows(),
                self.num_classes
            )));
        }
        if let Some(dir_labels) = dir_labels {
            if self.direction_offset.is_none() {
                return Err(Error::InvalidShape(
                    "direction labels given but direction classifier disabled".to_string(),
                ));
            }
            if dir_labels.len() != boxes.nrows() {
                return Err(Error::InvalidShape(format!(
                    "{} direction labels for {} boxes",
                    dir_labels.len(),
                    boxes.nrows()
                )));
            }
        }
        if let Some(class_thresholds) = &self.class_thresholds
            && class_thresholds.len() != self.num_classes
        {
            return Err(Error::InvalidConfig(format!(
                "{} class NMS thresholds for {} classes",
                class_thresholds.len(),
                self.num_classes
            )));
        }

        let bev: Vec<BevBox> = boxes
            .rows()
            .into_iter()
            .map(|row| BoundingBox3d::from_row(row).bev())
            .collect();
        let candidates: Vec<Candidate> = match &self.class_thresholds {
            Some(class_thresholds) => {
                let per_class: Vec<Vec<Candidate>> = class_thresholds
                    .par_iter()
                    .enumerate()
                    .map(|(label, thresholds)| {
                        let class_scores = scores.column(label);
                        let selected: Vec<(usize, f32)> = class_scores
                            .iter()
                            .copied()
                            .enumerate()
                            .filter(|&(_, score)| score >= thresholds.score_threshold)
                            .collect();
                        self.run_nms(&bev, &selected, thresholds)
                            .into_iter()
                            .map(|i| Candidate {
                                anchor: selected[i].0,
                                label,
                                score: selected[i].1,
                            })
                            .collect()
                    })
                    .collect();
                per_class.into_iter().flatten().collect()
            }
            None => {
                let mut labels = Vec::new();
                let mut selected = Vec::new();
                for (anchor, row) in scores.rows().into_iter().enumerate() {
                    let Ok(label) = row.argmax() else {
                        continue;
                    };
                    if row[label] >= self.thresholds.score_threshold {
                        selected.push((anchor, row[label]));
                        labels.push(label);
                    }
                }
                self.run_nms(&bev, &selected, &self.thresholds)
                    .into_iter()
                    .map(|i| Candidate {
                        anchor: selected[i].0,
                        label: labels[i],
                        score: selected[i].1,
                    })
                    .collect()
            }
        };

        Ok(candidates
            .into_iter()
            .filter_map(|c| {
                let row = boxes.row(c.anchor);
                let mut bbox = BoundingBox3d::from_row(row);
                if !self.in_center_range(&bbox) {
                    return None;
                }
                if let (Some(offset), Some(dir_labels)) = (self.direction_offset, dir_labels) {
                    bbox.heading = correct_heading(bbox.heading, dir_labels[c.anchor], offset);
                }
                Some(DetectBox3d {
                    bbox,
                    velocity: velocity(row),
                    score: c.score,
                    label: c.label,
                })
            })
            .collect())
    }

    /// NMS over `(anchor, score)` candidates, returning indices into
    /// `selected` of the survivors.
    fn run_nms(
        &self,
        bev: &[BevBox],
        selected: &[(usize, f32)],
        thresholds: &NmsThresholds,
    ) -> Vec<usize> {
        if selected.is_empty() {
            return Vec::new();
        }
        let boxes: Vec<BevBox> = selected.iter().map(|&(anchor, _)| bev[anchor]).collect();
        let scores: Vec<f32> = selected.iter().map(|&(_, score)| score).collect();
        nms(
            self.nms,
            &boxes,
            &scores,
            Some(thresholds.pre_max_size),
            Some(thresholds.post_max_size),
            thresholds.iou_threshold,
        )
    }

    fn in_center_range(&self, bbox: &BoundingBox3d) -> bool {
        match self.post_center_range {
            Some(range) => bbox
                .center()
                .iter()
                .enumerate()
                .all(|(i, &c)| c >= range[i] && c <= range[i + 3]),
            None => true,
        }
    }
}

/// Flips the heading by a half turn when the predicted direction bin
/// disagrees with the side of `offset` the heading lies on.
pub fn correct_heading(heading: f32, dir_label: usize, offset: f32) -> f32 {
    if (heading - offset > 0.0) ^ (dir_label == 1) {
        heading + PI
    } else {
        heading
    }
}

fn direction_labels(dir_cls_preds: ArrayView2<f32>) -> Vec<usize> {
    dir_cls_preds
        .rows()
        .into_iter()
        .map(|row| row.argmax().unwrap_or(0))
        .collect()
}

fn velocity(row: ArrayView1<f32>) -> Option<[f32; 2]> {
    (row.len() > VELOCITY_INDEX + 1).then(|| [row[VELOCITY_INDEX], row[VELOCITY_INDEX + 1]])
}
