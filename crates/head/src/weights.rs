// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

use std::str::FromStr;

use ndarray::{Array2, ArrayView2, Zip};
use serde::{Deserialize, Serialize};

use crate::Error;

/// How per-anchor loss weights are normalized within a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossNormType {
    /// Divide every weight by the number of positive anchors.
    #[default]
    NormByNumPositives,
    /// Classification weights by the number of cared anchors, regression
    /// weights by the number of positives.
    NormByNumExamples,
    /// Positives by the positive count, negatives by the negative count.
    NormByNumPosNeg,
    DontNorm,
}

impl FromStr for LossNormType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "norm_by_num_positives" => Ok(LossNormType::NormByNumPositives),
            "norm_by_num_examples" => Ok(LossNormType::NormByNumExamples),
            "norm_by_num_pos_neg" => Ok(LossNormType::NormByNumPosNeg),
            "dont_norm" => Ok(LossNormType::DontNorm),
            other => Err(Error::UnknownLossNorm(other.to_string())),
        }
    }
}

/// Per-anchor weights derived from integer labels.
#[derive(Debug, Clone, PartialEq)]
pub struct LossWeights {
    pub cls_weights: Array2<f32>,
    pub reg_weights: Array2<f32>,
    /// true where the anchor takes part in the classification loss
    pub cared: Array2<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossWeightAssigner {
    pub pos_class_weight: f32,
    pub neg_class_weight: f32,
    pub norm: LossNormType,
}

impl Default for LossWeightAssigner {
    fn default() -> Self {
        Self {
            pos_class_weight: 1.0,
            neg_class_weight: 1.0,
            norm: LossNormType::NormByNumPositives,
        }
    }
}

impl LossWeightAssigner {
    /// Converts `[batch, anchors]` labels (`>0` positive, `0` negative, `<0`
    /// ignored) into classification and regression weights.
    pub fn assign(&self, labels: ArrayView2<i32>) -> LossWeights {
        let cared = labels.mapv(|l| l >= 0);
        let mut cls_weights = labels.mapv(|l| match l {
            l if l > 0 => self.pos_class_weight,
            0 => self.neg_class_weight,
            _ => 0.0,
        });
        let mut reg_weights = labels.mapv(|l| if l > 0 { self.pos_class_weight } else { 0.0 });

        Zip::from(cls_weights.rows_mut())
            .and(reg_weights.rows_mut())
            .and(labels.rows())
            .for_each(|mut cls, mut reg, labels| {
                let positives = labels.iter().filter(|&&l| l > 0).count() as f32;
                let negatives = labels.iter().filter(|&&l| l == 0).count() as f32;
                // every normalizer is clamped to 1 so empty samples stay finite
                match self.norm {
                    LossNormType::NormByNumPositives => {
                        let normalizer = positives.max(1.0);
                        cls.mapv_inplace(|w| w / normalizer);
                        reg.mapv_inplace(|w| w / normalizer);
                    }
                    LossNormType::NormByNumExamples => {
                        let examples = (positives + negatives).max(1.0);
                        cls.mapv_inplace(|w| w / examples);
                        reg.mapv_inplace(|w| w / positives.max(1.0));
                    }
                    LossNormType::NormByNumPosNeg => {
                        let pos_normalizer = positives.max(1.0);
                        let neg_normalizer = negatives.max(1.0);
                        Zip::from(&mut cls).and(&labels).for_each(|w, &l| {
                            if l > 0 {
                                *w /= pos_normalizer;
                            } else if l == 0 {
                                *w /= neg_normalizer;
                            }
                        });
                        reg.mapv_inplace(|w| w / pos_normalizer);
                    }
                    LossNormType::DontNorm => {}
                }
            });

        LossWeights {
            cls_weights,
            reg_weights,
            cared,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    #[test]
    fn test_single_positive_scenario() {
        let labels = array![[1, 0, -1]];
        let weights = LossWeightAssigner::default().assign(labels.view());
        assert_eq!(weights.cared, array![[true, true, false]]);
        assert_eq!(weights.cls_weights, array![[1.0_f32, 1.0, 0.0]]);
        assert_eq!(weights.reg_weights, array![[1.0_f32, 0.0, 0.0]]);
    }

    #[test]
    fn test_no_positives_stays_finite() {
        let labels = array![[0, 0, -1, 0], [-1, -1, -1, -1]];
        for norm in [
            LossNormType::NormByNumPositives,
            LossNormType::NormByNumExamples,
            LossNormType::NormByNumPosNeg,
            LossNormType::DontNorm,
        ] {
            let assigner = LossWeightAssigner {
                pos_class_weight: 2.0,
                neg_class_weight: 0.5,
                norm,
            };
            let weights = assigner.assign(labels.view());
            assert!(weights.reg_weights.iter().all(|&w| w == 0.0), "{norm:?}");
            assert!(weights.cls_weights.iter().all(|w| w.is_finite()), "{norm:?}");
        }
    }

    #[test]
    fn test_cared_is_exactly_non_negative_labels() {
        let labels = array![[3, -1, 0, -7, 1, 2], [-1, 0, 0, 5, -2, 0]];
        let weights = LossWeightAssigner::default().assign(labels.view());
        for (&l, &c) in labels.iter().zip(weights.cared.iter()) {
            assert_eq!(c, l >= 0);
        }
    }

    #[test]
    fn test_norm_by_num_positives_per_sample() {
        let labels = array![[1, 2, 0, 0], [1, 0, 0, -1]];
        let assigner = LossWeightAssigner {
            pos_class_weight: 1.0,
            neg_class_weight: 1.0,
            norm: LossNormType::NormByNumPositives,
        };
        let weights = assigner.assign(labels.view());
        assert_eq!(weights.cls_weights, array![[0.5_f32, 0.5, 0.5, 0.5], [1.0, 1.0, 1.0, 0.0]]);
        assert_eq!(weights.reg_weights, array![[0.5_f32, 0.5, 0.0, 0.0], [1.0, 0.0, 0.0, 0.0]]);
    }

    #[test]
    fn test_norm_by_num_examples_and_pos_neg() {
        let labels = array![[1, 0, 0, -1]];
        let examples = LossWeightAssigner {
            norm: LossNormType::NormByNumExamples,
            ..Default::default()
        }
        .assign(labels.view());
        for (w, e) in examples.cls_weights.iter().zip([1.0_f32 / 3.0, 1.0 / 3.0, 1.0 / 3.0, 0.0]) {
            assert_abs_diff_eq!(*w, e, epsilon = 1e-6);
        }

        let pos_neg = LossWeightAssigner {
            norm: LossNormType::NormByNumPosNeg,
            ..Default::default()
        }
        .assign(labels.view());
        assert_eq!(pos_neg.cls_weights, array![[1.0_f32, 0.5, 0.5, 0.0]]);
        assert_eq!(pos_neg.reg_weights, array![[1.0_f32, 0.0, 0.0, 0.0]]);
    }

    #[test]
    fn test_dont_norm_passes_weights_through() {
        let labels = Array2::from_elem((2, 5), 1);
        let weights = LossWeightAssigner {
            pos_class_weight: 3.0,
            neg_class_weight: 1.0,
            norm: LossNormType::DontNorm,
        }
        .assign(labels.view());
        assert!(weights.cls_weights.iter().all(|&w| w == 3.0));
        assert!(weights.reg_weights.iter().all(|&w| w == 3.0));
    }

    #[test]
    fn test_loss_norm_from_str() {
        assert_eq!(
            "norm_by_num_pos_neg".parse::<LossNormType>().unwrap(),
            LossNormType::NormByNumPosNeg
        );
        assert!(matches!(
            "norm_by_magic".parse::<LossNormType>(),
            Err(Error::UnknownLossNorm(name)) if name == "norm_by_magic"
        ));
    }
}
