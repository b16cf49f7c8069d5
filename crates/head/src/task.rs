// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use log::debug;
use ndarray::{Array2, Array3, ArrayView3};

use crate::{
    Error, Result,
    composite::{CompositeLossComputer, LossInputs, LossRecord},
    config::HeadConfig,
    postprocess::{PostProcessor, SampleDetections},
    weights::LossWeightAssigner,
};

/// Raw outputs of one task's proposal network, shaped
/// `[batch, anchors, channels]`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPrediction {
    WithDirection {
        box_preds: Array3<f32>,
        cls_preds: Array3<f32>,
        dir_cls_preds: Array3<f32>,
    },
    WithoutDirection {
        box_preds: Array3<f32>,
        cls_preds: Array3<f32>,
    },
}

impl TaskPrediction {
    pub fn box_preds(&self) -> ArrayView3<'_, f32> {
        match self {
            TaskPrediction::WithDirection { box_preds, .. }
            | TaskPrediction::WithoutDirection { box_preds, .. } => box_preds.view(),
        }
    }

    pub fn cls_preds(&self) -> ArrayView3<'_, f32> {
        match self {
            TaskPrediction::WithDirection { cls_preds, .. }
            | TaskPrediction::WithoutDirection { cls_preds, .. } => cls_preds.view(),
        }
    }

    pub fn dir_cls_preds(&self) -> Option<ArrayView3<'_, f32>> {
        match self {
            TaskPrediction::WithDirection { dir_cls_preds, .. } => Some(dir_cls_preds.view()),
            TaskPrediction::WithoutDirection { .. } => None,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.box_preds().dim().0
    }
}

/// Training targets of one task, produced by the upstream target assigner.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTargets {
    /// `[batch, anchors]`: `>0` class, `0` background, `<0` ignored
    pub labels: Array2<i32>,
    /// `[batch, anchors, code]` box coder encodings
    pub reg_targets: Array3<f32>,
}

/// Loss and post-processing of a single task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskHead {
    pub task_id: usize,
    pub assigner: LossWeightAssigner,
    pub loss: CompositeLossComputer,
    pub post: PostProcessor,
}

impl TaskHead {
    pub fn from_config(config: &HeadConfig, task_id: usize) -> Result<Self> {
        Ok(Self {
            task_id,
            assigner: config.loss.weight_assigner(),
            loss: CompositeLossComputer::from_config(config, task_id)?,
            post: PostProcessor::from_config(config, task_id)?,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.loss.num_classes
    }

    pub fn encode_background_as_zeros(&self) -> bool {
        self.loss.encode_background_as_zeros
    }

    pub fn compute_loss<'a>(
        &self,
        prediction: &'a TaskPrediction,
        targets: &'a TaskTargets,
        anchors: ArrayView3<'a, f32>,
    ) -> Result<LossRecord> {
        let weights = self.assigner.assign(targets.labels.view());
        debug!(
            "task {}: {} positive anchors",
            self.task_id,
            targets.labels.iter().filter(|&&l| l > 0).count()
        );
        self.loss.compute(
            LossInputs {
                box_preds: prediction.box_preds(),
                cls_preds: prediction.cls_preds(),
                dir_cls_preds: prediction.dir_cls_preds(),
                labels: targets.labels.view(),
                reg_targets: targets.reg_targets.view(),
                anchors,
            },
            &weights,
        )
    }

    /// Detections of every sample, labels local to this task.
    pub fn post_process<M: Clone>(
        &self,
        prediction: &TaskPrediction,
        anchors: ArrayView3<f32>,
        metadata: &[M],
    ) -> Result<Vec<SampleDetections<M>>> {
        if metadata.len() != prediction.batch_size() {
            return Err(Error::InvalidShape(format!(
                "{} metadata entries for a batch of {}",
                metadata.len(),
                prediction.batch_size()
            )));
        }
        let samples = self.post.process(
            prediction.box_preds(),
            prediction.cls_preds(),
            prediction.dir_cls_preds(),
            anchors,
        )?;
        debug!(
            "task {}: {} detections",
            self.task_id,
            samples.iter().map(Vec::len).sum::<usize>()
        );
        Ok(samples
            .into_iter()
            .zip(metadata)
            .map(|(detections, metadata)| SampleDetections {
                detections,
                metadata: metadata.clone(),
            })
            .collect())
    }
}
