// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use log::debug;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, Zip, s};
use voxelhead_boxes::HEADING_INDEX;

use crate::{
    Error, Result,
    config::HeadConfig,
    losses::{ClassificationLoss, LocalizationLoss},
    weights::LossWeights,
};

/// Everything one task produced during a training forward pass.
#[derive(Debug, Clone)]
pub struct LossRecord {
    /// weighted sum of the reduced terms
    pub loss: f32,
    pub cls_loss: Array3<f32>,
    pub loc_loss: Array3<f32>,
    pub cls_pos_loss: f32,
    pub cls_neg_loss: f32,
    pub cls_preds: Array3<f32>,
    pub dir_loss_reduced: Option<f32>,
    pub cls_loss_reduced: f32,
    pub loc_loss_reduced: f32,
    pub cared: Array2<bool>,
}

/// Borrowed inputs of one task's loss.
#[derive(Debug, Clone, Copy)]
pub struct LossInputs<'a> {
    pub box_preds: ArrayView3<'a, f32>,
    pub cls_preds: ArrayView3<'a, f32>,
    pub dir_cls_preds: Option<ArrayView3<'a, f32>>,
    pub labels: ArrayView2<'a, i32>,
    pub reg_targets: ArrayView3<'a, f32>,
    pub anchors: ArrayView3<'a, f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionLoss {
    pub offset: f32,
    pub weight: f32,
}

/// Combines classification, localization and direction losses of one task.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeLossComputer {
    pub num_classes: usize,
    /// Box code width of the box coder.
    pub code_size: usize,
    pub encode_background_as_zeros: bool,
    pub encode_rad_error_by_sin: bool,
    pub classification: ClassificationLoss,
    pub localization: LocalizationLoss,
    pub classification_loss_weight: f32,
    pub localization_loss_weight: f32,
    /// `None` when the head has no direction classifier.
    pub direction: Option<DirectionLoss>,
}

impl CompositeLossComputer {
    pub fn from_config(config: &HeadConfig, task_id: usize) -> Result<Self> {
        let task = config.tasks.get(task_id).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "Task {task_id} requested but config has {} tasks",
                config.tasks.len()
            ))
        })?;
        let loss = &config.loss;
        Ok(Self {
            num_classes: task.num_classes,
            code_size: config.box_coder.code_size(),
            encode_background_as_zeros: config.encode_background_as_zeros(task_id),
            encode_rad_error_by_sin: loss.encode_rad_error_by_sin,
            classification: loss.classification.clone(),
            localization: loss.localization.clone(),
            classification_loss_weight: loss.classification_loss_weight,
            localization_loss_weight: loss.localization_loss_weight,
            direction: config
                .direction
                .use_direction_classifier
                .then_some(DirectionLoss {
                    offset: config.direction.direction_offset,
                    weight: loss.direction_loss_weight,
                }),
        })
    }

    /// Number of classification channels the predictions must carry.
    pub fn num_cls_channels(&self) -> usize {
        if self.encode_background_as_zeros {
            self.num_classes
        } else {
            self.num_classes + 1
        }
    }

    pub fn compute(&self, inputs: LossInputs, weights: &LossWeights) -> Result<LossRecord> {
        self.check_shapes(&inputs, weights)?;
        let batch_size = inputs.labels.nrows().max(1) as f32;

        let cls_targets = self.one_hot_targets(inputs.labels)?;
        let cls_loss =
            self.classification
                .compute(inputs.cls_preds, cls_targets.view(), weights.cls_weights.view());

        let loc_loss = if self.encode_rad_error_by_sin {
            let (preds, targets) = add_sin_difference(inputs.box_preds, inputs.reg_targets);
            self.localization
                .compute(preds.view(), targets.view(), weights.reg_weights.view())
        } else {
            self.localization
                .compute(inputs.box_preds, inputs.reg_targets, weights.reg_weights.view())
        };

        let (cls_pos_loss, cls_neg_loss) = pos_neg_loss(cls_loss.view(), inputs.labels);
        let cls_loss_reduced = cls_loss.sum() / batch_size * self.classification_loss_weight;
        let loc_loss_reduced = loc_loss.sum() / batch_size * self.localization_loss_weight;
        let mut loss = cls_loss_reduced + loc_loss_reduced;

        let dir_loss_reduced = match (self.direction, inputs.dir_cls_preds) {
            (Some(direction), Some(dir_cls_preds)) => {
                let dir_loss = direction_loss(
                    dir_cls_preds,
                    inputs.labels,
                    inputs.reg_targets,
                    inputs.anchors,
                    direction.offset,
                );
                let reduced = direction.weight * dir_loss / batch_size;
                loss += reduced;
                Some(reduced)
            }
            _ => None,
        };

        debug!(
            "loss {loss:.4}: cls {cls_loss_reduced:.4} loc {loc_loss_reduced:.4} dir {dir_loss_reduced:?}"
        );
        Ok(LossRecord {
            loss,
            cls_loss,
            loc_loss,
            cls_pos_loss,
            cls_neg_loss,
            cls_preds: inputs.cls_preds.to_owned(),
            dir_loss_reduced,
            cls_loss_reduced,
            loc_loss_reduced,
            cared: weights.cared.clone(),
        })
    }

    fn check_shapes(&self, inputs: &LossInputs, weights: &LossWeights) -> Result<()> {
        let (batch, anchors) = inputs.labels.dim();
        for (name, dim) in [
            ("cls_weights", weights.cls_weights.dim()),
            ("reg_weights", weights.reg_weights.dim()),
            ("cared", weights.cared.dim()),
        ] {
            if dim != (batch, anchors) {
                return Err(Error::InvalidShape(format!(
                    "{name} has shape {dim:?}, expected ({batch}, {anchors})"
                )));
            }
        }
        let check = |name: &str, dim: (usize, usize, usize), channels: Option<usize>| {
            let ok = dim.0 == batch && dim.1 == anchors && channels.is_none_or(|c| dim.2 == c);
            if ok {
                Ok(())
            } else {
                Err(Error::InvalidShape(format!(
                    "{name} has shape {dim:?}, expected ({batch}, {anchors}, {})",
                    channels.map_or("_".to_string(), |c| c.to_string())
                )))
            }
        };
        check("box_preds", inputs.box_preds.dim(), Some(self.code_size))?;
        check(
            "reg_targets",
            inputs.reg_targets.dim(),
            Some(inputs.box_preds.dim().2),
        )?;
        check("cls_preds", inputs.cls_preds.dim(), Some(self.num_cls_channels()))?;
        check("anchors", inputs.anchors.dim(), None)?;
        if inputs.box_preds.dim().2 <= HEADING_INDEX || inputs.anchors.dim().2 <= HEADING_INDEX {
            return Err(Error::InvalidShape(format!(
                "box_preds and anchors need a heading column, got {} and {} columns",
                inputs.box_preds.dim().2,
                inputs.anchors.dim().2
            )));
        }
        match (self.direction, inputs.dir_cls_preds) {
            (Some(_), Some(dir)) => check("dir_cls_preds", dir.dim(), Some(2)),
            (None, None) => Ok(()),
            (Some(_), None) => Err(Error::InvalidShape(
                "direction classifier enabled but no dir_cls_preds given".to_string(),
            )),
            (None, Some(_)) => Err(Error::InvalidShape(
                "dir_cls_preds given but direction classifier disabled".to_string(),
            )),
        }
    }

    /// One-hot targets of ignored-as-background labels; channel 0 is dropped
    /// when the background has no explicit logit.
    fn one_hot_targets(&self, labels: ArrayView2<i32>) -> Result<Array3<f32>> {
        let (batch, anchors) = labels.dim();
        let offset = usize::from(self.encode_background_as_zeros);
        let mut targets = Array3::zeros((batch, anchors, self.num_cls_channels()));
        for ((b, m), &label) in labels.indexed_iter() {
            if label > self.num_classes as i32 {
                return Err(Error::InvalidLabel(label));
            }
            // ignored anchors are encoded as background
            let class = label.max(0) as usize;
            if class >= offset {
                targets[[b, m, class - offset]] = 1.0;
            }
        }
        Ok(targets)
    }
}

/// Replaces the heading channel of predictions and targets with
/// `sin(p) * cos(t)` and `cos(p) * sin(t)`, so their difference is
/// `sin(p - t)`.
pub fn add_sin_difference(
    box_preds: ArrayView3<f32>,
    reg_targets: ArrayView3<f32>,
) -> (Array3<f32>, Array3<f32>) {
    let mut preds = box_preds.to_owned();
    let mut targets = reg_targets.to_owned();
    Zip::from(preds.slice_mut(s![.., .., HEADING_INDEX]))
        .and(targets.slice_mut(s![.., .., HEADING_INDEX]))
        .for_each(|p, t| {
            let (sin_p, cos_p) = p.sin_cos();
            let (sin_t, cos_t) = t.sin_cos();
            *p = sin_p * cos_t;
            *t = cos_p * sin_t;
        });
    (preds, targets)
}

/// Classification loss split into positive and negative anchors, each summed
/// over every channel and divided by the batch size.
pub fn pos_neg_loss(cls_loss: ArrayView3<f32>, labels: ArrayView2<i32>) -> (f32, f32) {
    let batch_size = labels.nrows().max(1) as f32;
    let mut pos = 0.0;
    let mut neg = 0.0;
    Zip::from(cls_loss.lanes(Axis(2)))
        .and(labels)
        .for_each(|loss, &label| match label {
            l if l > 0 => pos += loss.sum(),
            0 => neg += loss.sum(),
            _ => {}
        });
    (pos / batch_size, neg / batch_size)
}

/// Bin 1 when the absolute heading lies above `offset`, bin 0 otherwise.
pub fn direction_targets(
    reg_targets: ArrayView3<f32>,
    anchors: ArrayView3<f32>,
    offset: f32,
) -> Array2<u8> {
    let mut targets = Array2::zeros((reg_targets.dim().0, reg_targets.dim().1));
    Zip::from(&mut targets)
        .and(reg_targets.slice(s![.., .., HEADING_INDEX]))
        .and(anchors.slice(s![.., .., HEADING_INDEX]))
        .for_each(|out, &residual, &anchor| {
            *out = u8::from(residual + anchor - offset > 0.0);
        });
    targets
}

/// Summed softmax cross-entropy of the two direction bins over positive
/// anchors, each sample weighted by its number of positives.
fn direction_loss(
    dir_cls_preds: ArrayView3<f32>,
    labels: ArrayView2<i32>,
    reg_targets: ArrayView3<f32>,
    anchors: ArrayView3<f32>,
    offset: f32,
) -> f32 {
    let targets = direction_targets(reg_targets, anchors, offset);
    let mut one_hot = Array3::zeros(dir_cls_preds.raw_dim());
    Zip::from(one_hot.lanes_mut(Axis(2)))
        .and(&targets)
        .for_each(|mut lane, &bin| lane[bin as usize] = 1.0);

    let mut weights = labels.mapv(|l| if l > 0 { 1.0_f32 } else { 0.0 });
    for mut row in weights.rows_mut() {
        let positives = row.sum().max(1.0);
        row.mapv_inplace(|w| w / positives);
    }
    ClassificationLoss::Softmax { logit_scale: 1.0 }
        .compute(dir_cls_preds, one_hot.view(), weights.view())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::LossWeightAssigner;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use std::f32::consts::{FRAC_PI_2, PI};

    fn computer(direction: Option<DirectionLoss>) -> CompositeLossComputer {
        CompositeLossComputer {
            num_classes: 2,
            code_size: 7,
            encode_background_as_zeros: true,
            encode_rad_error_by_sin: true,
            classification: ClassificationLoss::Sigmoid,
            localization: LocalizationLoss::WeightedL2 { code_weights: None },
            classification_loss_weight: 1.0,
            localization_loss_weight: 2.0,
            direction,
        }
    }

    fn heading_loss(pred: f32, target: f32) -> f32 {
        let mut preds = Array3::zeros((1, 1, 7));
        let mut targets = Array3::zeros((1, 1, 7));
        preds[[0, 0, 6]] = pred;
        targets[[0, 0, 6]] = target;
        let (p, t) = add_sin_difference(preds.view(), targets.view());
        let loss = LocalizationLoss::WeightedL2 { code_weights: None }.compute(
            p.view(),
            t.view(),
            Array2::ones((1, 1)).view(),
        );
        loss[[0, 0, 6]]
    }

    #[test]
    fn test_sin_difference_ignores_half_turns() {
        assert_abs_diff_eq!(heading_loss(0.3 + PI, 0.3), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(heading_loss(-1.0, -1.0 - PI), 0.0, epsilon = 1e-6);
        let quarter = heading_loss(0.3 + FRAC_PI_2, 0.3);
        assert_abs_diff_eq!(quarter, 0.5, epsilon = 1e-6);
        for delta in [0.1, 0.5, 1.0, 2.0, 3.0] {
            assert!(heading_loss(delta, 0.0) <= quarter + 1e-6);
        }
    }

    #[test]
    fn test_one_hot_targets() {
        let labels = array![[2, 0, -1, 1]];
        let zeros = computer(None).one_hot_targets(labels.view()).unwrap();
        assert_eq!(
            zeros,
            array![[[0.0_f32, 1.0], [0.0, 0.0], [0.0, 0.0], [1.0, 0.0]]]
        );

        let explicit = CompositeLossComputer {
            encode_background_as_zeros: false,
            ..computer(None)
        };
        let onehot = explicit.one_hot_targets(labels.view()).unwrap();
        assert_eq!(onehot.dim(), (1, 4, 3));
        assert_eq!(onehot[[0, 0, 2]], 1.0);
        assert_eq!(onehot[[0, 2, 0]], 1.0);

        assert!(matches!(
            computer(None).one_hot_targets(array![[3]].view()),
            Err(Error::InvalidLabel(3))
        ));
    }

    #[test]
    fn test_direction_targets() {
        let reg_targets = array![[[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.2], [
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -0.2
        ]]];
        let anchors = array![[[0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0], [
            0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0
        ]]];
        let targets = direction_targets(reg_targets.view(), anchors.view(), 0.0);
        assert_eq!(targets, array![[1_u8, 0]]);
        let targets = direction_targets(reg_targets.view(), anchors.view(), 0.5);
        assert_eq!(targets, array![[0_u8, 0]]);
    }

    #[test]
    fn test_no_positives_gives_finite_loss() {
        let labels = array![[0, 0, -1], [0, -1, -1]];
        let weights = LossWeightAssigner::default().assign(labels.view());
        let box_preds = Array3::from_elem((2, 3, 7), 0.3);
        let reg_targets = Array3::zeros((2, 3, 7));
        let cls_preds = Array3::from_elem((2, 3, 2), -1.0);
        let dir_cls_preds = Array3::zeros((2, 3, 2));
        let anchors = Array3::ones((2, 3, 7));
        let record = computer(Some(DirectionLoss {
            offset: 0.0,
            weight: 0.2,
        }))
        .compute(
            LossInputs {
                box_preds: box_preds.view(),
                cls_preds: cls_preds.view(),
                dir_cls_preds: Some(dir_cls_preds.view()),
                labels: labels.view(),
                reg_targets: reg_targets.view(),
                anchors: anchors.view(),
            },
            &weights,
        )
        .unwrap();
        assert!(record.loss.is_finite());
        assert_eq!(record.loc_loss_reduced, 0.0);
        assert_eq!(record.dir_loss_reduced, Some(0.0));
        assert_eq!(record.cls_pos_loss, 0.0);
        assert!(record.cls_neg_loss > 0.0);
        assert_abs_diff_eq!(
            record.cls_loss_reduced,
            record.cls_pos_loss + record.cls_neg_loss,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_loss_reduction_and_weights() {
        let labels = array![[1, 0]];
        let weights = LossWeightAssigner::default().assign(labels.view());
        let mut box_preds = Array3::zeros((1, 2, 7));
        box_preds[[0, 0, 0]] = 1.0;
        let reg_targets = Array3::zeros((1, 2, 7));
        let cls_preds = Array3::zeros((1, 2, 2));
        let anchors = Array3::ones((1, 2, 7));
        let record = computer(None)
            .compute(
                LossInputs {
                    box_preds: box_preds.view(),
                    cls_preds: cls_preds.view(),
                    dir_cls_preds: None,
                    labels: labels.view(),
                    reg_targets: reg_targets.view(),
                    anchors: anchors.view(),
                },
                &weights,
            )
            .unwrap();
        // 0.5 * 1^2 on the positive anchor, scaled by the loc weight
        assert_abs_diff_eq!(record.loc_loss_reduced, 1.0, epsilon = 1e-6);
        // four logits at zero, each ln 2
        assert_abs_diff_eq!(record.cls_loss_reduced, 4.0 * 2.0_f32.ln(), epsilon = 1e-5);
        assert_abs_diff_eq!(
            record.loss,
            record.cls_loss_reduced + record.loc_loss_reduced,
            epsilon = 1e-6
        );
        assert!(record.dir_loss_reduced.is_none());
        assert_eq!(record.cared, array![[true, true]]);
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let labels = array![[1, 0, 0]];
        let weights = LossWeightAssigner::default().assign(labels.view());
        let box_preds = Array3::zeros((1, 3, 7));
        let reg_targets = Array3::zeros((1, 2, 7));
        let cls_preds = Array3::zeros((1, 3, 2));
        let anchors = Array3::ones((1, 3, 7));
        let inputs = LossInputs {
            box_preds: box_preds.view(),
            cls_preds: cls_preds.view(),
            dir_cls_preds: None,
            labels: labels.view(),
            reg_targets: reg_targets.view(),
            anchors: anchors.view(),
        };
        assert!(matches!(
            computer(None).compute(inputs, &weights),
            Err(Error::InvalidShape(_))
        ));

        let reg_targets = Array3::zeros((1, 3, 7));
        let inputs = LossInputs {
            reg_targets: reg_targets.view(),
            ..inputs
        };
        let with_direction = computer(Some(DirectionLoss {
            offset: 0.0,
            weight: 0.2,
        }));
        assert!(matches!(
            with_direction.compute(inputs, &weights),
            Err(Error::InvalidShape(_))
        ));
        assert!(computer(None).compute(inputs, &weights).is_ok());
    }

    #[test]
    fn test_weights_must_match_labels() {
        let labels = array![[1, 0, 0]];
        let weights = LossWeightAssigner::default().assign(array![[1, 0]].view());
        let box_preds = Array3::zeros((1, 3, 7));
        let reg_targets = Array3::zeros((1, 3, 7));
        let cls_preds = Array3::zeros((1, 3, 2));
        let anchors = Array3::ones((1, 3, 7));
        let inputs = LossInputs {
            box_preds: box_preds.view(),
            cls_preds: cls_preds.view(),
            dir_cls_preds: None,
            labels: labels.view(),
            reg_targets: reg_targets.view(),
            anchors: anchors.view(),
        };
        assert!(matches!(
            computer(None).compute(inputs, &weights),
            Err(Error::InvalidShape(_))
        ));

        let weights = LossWeights {
            cared: Array2::from_elem((1, 2), true),
            ..LossWeightAssigner::default().assign(labels.view())
        };
        assert!(matches!(
            computer(None).compute(inputs, &weights),
            Err(Error::InvalidShape(_))
        ));
    }

    #[test]
    fn test_box_width_must_match_coder() {
        let labels = array![[1, 0]];
        let weights = LossWeightAssigner::default().assign(labels.view());
        let box_preds = Array3::zeros((1, 2, 9));
        let reg_targets = Array3::zeros((1, 2, 9));
        let cls_preds = Array3::zeros((1, 2, 2));
        let anchors = Array3::ones((1, 2, 7));
        let inputs = LossInputs {
            box_preds: box_preds.view(),
            cls_preds: cls_preds.view(),
            dir_cls_preds: None,
            labels: labels.view(),
            reg_targets: reg_targets.view(),
            anchors: anchors.view(),
        };
        assert!(matches!(
            computer(None).compute(inputs, &weights),
            Err(Error::InvalidShape(_))
        ));
        let velocity = CompositeLossComputer {
            code_size: 9,
            ..computer(None)
        };
        assert!(velocity.compute(inputs, &weights).is_ok());
    }
}
