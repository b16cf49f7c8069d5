// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use log::info;
use ndarray::{Array3, ArrayView2};
use rayon::prelude::*;

use crate::{
    Error, Result,
    composite::LossRecord,
    config::HeadConfig,
    metrics::{AveragePolicy, MetricsAccumulator, MetricsBatch},
    postprocess::{DetectBox3d, SampleDetections},
    task::{TaskHead, TaskPrediction, TaskTargets},
};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DetectorBuilder {
    config_src: Option<ConfigSource>,
}

#[derive(Debug, Clone, PartialEq)]
enum ConfigSource {
    Yaml(String),
    Json(String),
    Config(HeadConfig),
}

impl DetectorBuilder {
    /// Creates a builder without configuration. A configuration must be
    /// provided before building the detector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a head configuration in YAML format. The string is only parsed
    /// by [`DetectorBuilder::build`].
    ///
    /// # Examples
    /// ```rust
    /// # use voxelhead_head::{DetectorBuilder, Result};
    /// # fn main() -> Result<()> {
    /// let detector = DetectorBuilder::new()
    ///     .with_config_yaml_str("tasks: [{num_classes: 1}, {num_classes: 2}]".to_string())
    ///     .build()?;
    /// assert_eq!(detector.class_counts(), vec![1, 2]);
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_config_yaml_str(mut self, yaml_str: String) -> Self {
        self.config_src.replace(ConfigSource::Yaml(yaml_str));
        self
    }

    /// Loads a head configuration in JSON format. The string is only parsed
    /// by [`DetectorBuilder::build`].
    pub fn with_config_json_str(mut self, json_str: String) -> Self {
        self.config_src.replace(ConfigSource::Json(json_str));
        self
    }

    pub fn with_config(mut self, config: HeadConfig) -> Self {
        self.config_src.replace(ConfigSource::Config(config));
        self
    }

    /// Parses and validates the configuration and resolves one head per task.
    pub fn build(self) -> Result<MultiTaskDetector> {
        let config: HeadConfig = match self.config_src {
            Some(ConfigSource::Json(s)) => serde_json::from_str(&s)?,
            Some(ConfigSource::Yaml(s)) => serde_yaml::from_str(&s)?,
            Some(ConfigSource::Config(c)) => c,
            None => return Err(Error::NoConfig),
        };
        config.validate()?;

        let heads = (0..config.tasks.len())
            .map(|task_id| TaskHead::from_config(&config, task_id))
            .collect::<Result<Vec<_>>>()?;
        info!(
            "Detection head with {} tasks, class counts {:?}",
            heads.len(),
            heads.iter().map(TaskHead::num_classes).collect::<Vec<_>>()
        );
        info!(
            "Box coder {:?}, NMS {:?} (multi-class: {})",
            config.box_coder, config.post_process.nms, config.post_process.use_multi_class_nms
        );
        if config.direction.use_direction_classifier {
            info!("Direction offset: {}", config.direction.direction_offset);
        }
        Ok(MultiTaskDetector { config, heads })
    }
}

/// Runs every task head and merges their detections.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiTaskDetector {
    config: HeadConfig,
    heads: Vec<TaskHead>,
}

impl MultiTaskDetector {
    pub fn config(&self) -> &HeadConfig {
        &self.config
    }

    pub fn heads(&self) -> &[TaskHead] {
        &self.heads
    }

    pub fn num_tasks(&self) -> usize {
        self.heads.len()
    }

    pub fn class_counts(&self) -> Vec<usize> {
        self.heads.iter().map(TaskHead::num_classes).collect()
    }

    fn check_task_count(&self, name: &str, len: usize) -> Result<()> {
        if len != self.heads.len() {
            return Err(Error::InvalidShape(format!(
                "{len} {name} for {} tasks",
                self.heads.len()
            )));
        }
        Ok(())
    }

    /// Training pass: one loss record per task. Tasks are evaluated in
    /// parallel and the first failing task aborts the call.
    pub fn compute_loss(
        &self,
        predictions: &[TaskPrediction],
        targets: &[TaskTargets],
        anchors: &[Array3<f32>],
    ) -> Result<Vec<LossRecord>> {
        self.check_task_count("predictions", predictions.len())?;
        self.check_task_count("targets", targets.len())?;
        self.check_task_count("anchor sets", anchors.len())?;
        self.heads
            .par_iter()
            .enumerate()
            .map(|(i, head)| head.compute_loss(&predictions[i], &targets[i], anchors[i].view()))
            .collect()
    }

    /// Inference pass: one merged detection list per sample, labels
    /// enumerated over the classes of all tasks.
    pub fn post_process<M: Clone + Send + Sync>(
        &self,
        predictions: &[TaskPrediction],
        anchors: &[Array3<f32>],
        metadata: &[M],
    ) -> Result<Vec<SampleDetections<M>>> {
        self.check_task_count("predictions", predictions.len())?;
        self.check_task_count("anchor sets", anchors.len())?;
        let per_task = self
            .heads
            .par_iter()
            .enumerate()
            .map(|(i, head)| head.post_process(&predictions[i], anchors[i].view(), metadata))
            .collect::<Result<Vec<_>>>()?;
        merge_task_detections(per_task, &self.class_counts())
    }

    /// Accumulator using the configured precision/recall thresholds.
    pub fn metrics(&self, policy: AveragePolicy) -> MetricsAccumulator {
        MetricsAccumulator::new(self.config.loss.rpn_thresholds.clone(), policy)
    }

    /// Metrics input for one task's loss record, using that task's background
    /// and score conventions.
    pub fn metrics_batch<'a>(
        &self,
        task_id: usize,
        record: &'a LossRecord,
        labels: ArrayView2<'a, i32>,
    ) -> Result<MetricsBatch<'a>> {
        let head = self.heads.get(task_id).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "Task {task_id} requested but detector has {} tasks",
                self.heads.len()
            ))
        })?;
        Ok(MetricsBatch {
            labels,
            cls_preds: record.cls_preds.view(),
            cared: record.cared.view(),
            encode_background_as_zeros: head.encode_background_as_zeros(),
            use_sigmoid_score: self.config.loss.use_sigmoid_score,
            cls_loss: record.cls_loss_reduced,
            loc_loss: record.loc_loss_reduced,
            total_loss: record.loss,
        })
    }
}

/// Merges `per_task[task][sample]` detections into one list per sample.
///
/// Detections are concatenated in task order and every label of task `i` is
/// shifted by the class counts of the tasks before it. Metadata is taken from
/// the first task.
pub fn merge_task_detections<M>(
    per_task: Vec<Vec<SampleDetections<M>>>,
    class_counts: &[usize],
) -> Result<Vec<SampleDetections<M>>> {
    if per_task.len() != class_counts.len() {
        return Err(Error::InvalidShape(format!(
            "{} task results for {} class counts",
            per_task.len(),
            class_counts.len()
        )));
    }
    let offsets = class_counts.iter().scan(0, |offset, &count| {
        let current = *offset;
        *offset += count;
        Some(current)
    });
    let mut tasks = per_task.into_iter().zip(offsets);
    let Some((first, _)) = tasks.next() else {
        return Ok(Vec::new());
    };
    tasks.try_fold(first, |merged, (task, offset)| {
        if task.len() != merged.len() {
            return Err(Error::InvalidShape(format!(
                "task results have {} and {} samples",
                merged.len(),
                task.len()
            )));
        }
        Ok(merged
            .into_iter()
            .zip(task)
            .map(|(mut sample, other)| {
                sample
                    .detections
                    .extend(other.detections.into_iter().map(|d| DetectBox3d {
                        label: d.label + offset,
                        ..d
                    }));
                sample
            })
            .collect())
    })
}
