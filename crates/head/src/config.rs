// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use voxelhead_boxes::{BoxCoder, NmsKind};

use crate::{
    Error, Result,
    losses::{ClassificationLoss, LocalizationLoss},
    weights::{LossNormType, LossWeightAssigner},
};

/// Parses an NMS mode name, reporting unknown names as a configuration error.
pub fn parse_nms_kind(name: &str) -> Result<NmsKind> {
    NmsKind::from_str(name).map_err(Error::UnknownNmsMode)
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct HeadConfig {
    pub tasks: Vec<TaskConfig>,
    #[serde(default)]
    pub box_coder: BoxCoder,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub direction: DirectionConfig,
    #[serde(default)]
    pub post_process: PostProcessConfig,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct TaskConfig {
    pub num_classes: usize,
    #[serde(default)]
    pub class_names: Vec<String>,
    /// Overrides [`LossConfig::encode_background_as_zeros`] for this task.
    #[serde(default)]
    pub encode_background_as_zeros: Option<bool>,
    /// Per-class thresholds for multi-class NMS, empty or one per class.
    #[serde(default)]
    pub class_nms: Vec<NmsThresholds>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Copy)]
pub struct NmsThresholds {
    pub score_threshold: f32,
    pub iou_threshold: f32,
    pub pre_max_size: usize,
    pub post_max_size: usize,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LossConfig {
    pub pos_class_weight: f32,
    pub neg_class_weight: f32,
    pub loss_norm_type: LossNormType,
    pub classification_loss_weight: f32,
    pub localization_loss_weight: f32,
    pub direction_loss_weight: f32,
    pub encode_background_as_zeros: bool,
    pub encode_rad_error_by_sin: bool,
    pub use_sigmoid_score: bool,
    pub classification: ClassificationLoss,
    pub localization: LocalizationLoss,
    /// Score thresholds for the precision/recall metrics.
    pub rpn_thresholds: Vec<f32>,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            pos_class_weight: 1.0,
            neg_class_weight: 1.0,
            loss_norm_type: LossNormType::NormByNumPositives,
            classification_loss_weight: 1.0,
            localization_loss_weight: 2.0,
            direction_loss_weight: 0.2,
            encode_background_as_zeros: true,
            encode_rad_error_by_sin: true,
            use_sigmoid_score: true,
            classification: ClassificationLoss::default(),
            localization: LocalizationLoss::default(),
            rpn_thresholds: vec![0.1, 0.3, 0.5, 0.7, 0.8, 0.9, 0.95],
        }
    }
}

impl LossConfig {
    pub fn weight_assigner(&self) -> LossWeightAssigner {
        LossWeightAssigner {
            pos_class_weight: self.pos_class_weight,
            neg_class_weight: self.neg_class_weight,
            norm: self.loss_norm_type,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct DirectionConfig {
    pub use_direction_classifier: bool,
    /// Reference angle, in radians, separating the two direction bins.
    pub direction_offset: f32,
}

impl Default for DirectionConfig {
    fn default() -> Self {
        Self {
            use_direction_classifier: true,
            direction_offset: 0.0,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct PostProcessConfig {
    pub nms: NmsKind,
    pub use_multi_class_nms: bool,
    pub nms_score_threshold: f32,
    pub nms_pre_max_size: usize,
    pub nms_post_max_size: usize,
    pub nms_iou_threshold: f32,
    /// `[xmin, ymin, zmin, xmax, ymax, zmax]` of the valid box centers.
    pub post_center_limit_range: Option<[f32; 6]>,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            nms: NmsKind::Rotate,
            use_multi_class_nms: false,
            nms_score_threshold: 0.05,
            nms_pre_max_size: 1000,
            nms_post_max_size: 100,
            nms_iou_threshold: 0.5,
            post_center_limit_range: None,
        }
    }
}

impl PostProcessConfig {
    /// Thresholds of the single-pass NMS, shared by every class.
    pub fn thresholds(&self) -> NmsThresholds {
        NmsThresholds {
            score_threshold: self.nms_score_threshold,
            iou_threshold: self.nms_iou_threshold,
            pre_max_size: self.nms_pre_max_size,
            post_max_size: self.nms_post_max_size,
        }
    }
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(Error::InvalidConfig(format!(
            "{name} must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

impl HeadConfig {
    /// Background handling of one task, falling back to the loss setting.
    pub fn encode_background_as_zeros(&self, task_id: usize) -> bool {
        self.tasks
            .get(task_id)
            .and_then(|t| t.encode_background_as_zeros)
            .unwrap_or(self.loss.encode_background_as_zeros)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(Error::InvalidConfig("No tasks found in config".to_string()));
        }
        for (task_id, task) in self.tasks.iter().enumerate() {
            if task.num_classes == 0 {
                return Err(Error::InvalidConfig(format!(
                    "Task {task_id} has no classes"
                )));
            }
            if !task.class_names.is_empty() && task.class_names.len() != task.num_classes {
                return Err(Error::InvalidConfig(format!(
                    "Task {task_id} names {} classes but has {}",
                    task.class_names.len(),
                    task.num_classes
                )));
            }
            if self.encode_background_as_zeros(task_id) && !self.loss.use_sigmoid_score {
                return Err(Error::InvalidConfig(format!(
                    "Task {task_id} encodes background as zeros which requires sigmoid scores"
                )));
            }
            if !task.class_nms.is_empty() {
                if task.class_nms.len() != task.num_classes {
                    return Err(Error::InvalidConfig(format!(
                        "Task {task_id} has {} class NMS entries for {} classes",
                        task.class_nms.len(),
                        task.num_classes
                    )));
                }
                for t in &task.class_nms {
                    check_unit("class score_threshold", t.score_threshold)?;
                    check_unit("class iou_threshold", t.iou_threshold)?;
                }
            }
        }

        if let Some(code_weights) = self.loss.localization.code_weights()
            && code_weights.len() != self.box_coder.code_size()
        {
            return Err(Error::InvalidConfig(format!(
                "{} code weights for a box code of size {}",
                code_weights.len(),
                self.box_coder.code_size()
            )));
        }

        check_unit("nms_score_threshold", self.post_process.nms_score_threshold)?;
        check_unit("nms_iou_threshold", self.post_process.nms_iou_threshold)?;
        for &t in &self.loss.rpn_thresholds {
            check_unit("rpn threshold", t)?;
        }
        if let Some(range) = self.post_process.post_center_limit_range
            && (0..3).any(|i| range[i] > range[i + 3])
        {
            return Err(Error::InvalidConfig(format!(
                "post_center_limit_range {range:?} has min above max"
            )));
        }
        Ok(())
    }
}
