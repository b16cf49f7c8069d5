// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Elementwise loss functions and the activations they share with
//! post-processing and metrics.
use ndarray::{Array1, Array3, ArrayView1, ArrayView2, ArrayView3, ArrayViewMut1, Axis, Zip};
use num_traits::Float;
use serde::{Deserialize, Serialize};

pub fn sigmoid<F: Float>(x: F) -> F {
    F::one() / (F::one() + (-x).exp())
}

pub fn softmax_inplace<F: Float>(mut row: ArrayViewMut1<F>) {
    let max = row.fold(F::neg_infinity(), |m, &v| m.max(v));
    row.mapv_inplace(|v| (v - max).exp());
    let sum = row.fold(F::zero(), |s, &v| s + v);
    row.mapv_inplace(|v| v / sum);
}

pub fn log_softmax<F: Float>(row: ArrayView1<F>) -> Array1<F> {
    let max = row.fold(F::neg_infinity(), |m, &v| m.max(v));
    let log_sum = row.fold(F::zero(), |s, &v| s + (v - max).exp()).ln() + max;
    row.mapv(|v| v - log_sum)
}

/// `max(x, 0) - x * z + ln(1 + exp(-|x|))`, stable for large logits.
fn sigmoid_cross_entropy(logit: f32, target: f32) -> f32 {
    logit.max(0.0) - logit * target + (-logit.abs()).exp().ln_1p()
}

fn default_sigma() -> f32 {
    3.0
}

fn default_gamma() -> f32 {
    2.0
}

fn default_alpha() -> f32 {
    0.25
}

fn default_logit_scale() -> f32 {
    1.0
}

/// Regression loss between box predictions and targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LocalizationLoss {
    SmoothL1 {
        #[serde(default = "default_sigma")]
        sigma: f32,
        #[serde(default)]
        code_weights: Option<Vec<f32>>,
    },
    WeightedL2 {
        #[serde(default)]
        code_weights: Option<Vec<f32>>,
    },
}

impl Default for LocalizationLoss {
    fn default() -> Self {
        LocalizationLoss::SmoothL1 {
            sigma: default_sigma(),
            code_weights: None,
        }
    }
}

impl LocalizationLoss {
    pub fn code_weights(&self) -> Option<&[f32]> {
        match self {
            LocalizationLoss::SmoothL1 { code_weights, .. }
            | LocalizationLoss::WeightedL2 { code_weights } => code_weights.as_deref(),
        }
    }

    /// Per-anchor, per-code loss `[batch, anchors, code]` scaled by the
    /// per-anchor `weights`. NaN targets contribute nothing.
    pub fn compute(
        &self,
        preds: ArrayView3<f32>,
        targets: ArrayView3<f32>,
        weights: ArrayView2<f32>,
    ) -> Array3<f32> {
        let code_weights = self.code_weights();
        let mut loss = Array3::zeros(preds.raw_dim());
        Zip::indexed(&mut loss)
            .and(&preds)
            .and(&targets)
            .for_each(|(b, m, c), out, &pred, &target| {
                let target = if target.is_nan() { pred } else { target };
                let mut diff = pred - target;
                if let Some(cw) = code_weights {
                    diff *= cw.get(c).copied().unwrap_or(1.0);
                }
                let value = match self {
                    LocalizationLoss::SmoothL1 { sigma, .. } => {
                        let sigma2 = sigma * sigma;
                        let abs = diff.abs();
                        if abs <= 1.0 / sigma2 {
                            0.5 * sigma2 * abs * abs
                        } else {
                            abs - 0.5 / sigma2
                        }
                    }
                    LocalizationLoss::WeightedL2 { .. } => 0.5 * diff * diff,
                };
                *out = value * weights[[b, m]];
            });
        loss
    }
}

/// Classification loss between logits and one-hot targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClassificationLoss {
    Sigmoid,
    SigmoidFocal {
        #[serde(default = "default_gamma")]
        gamma: f32,
        #[serde(default = "default_alpha")]
        alpha: f32,
    },
    Softmax {
        #[serde(default = "default_logit_scale")]
        logit_scale: f32,
    },
}

impl Default for ClassificationLoss {
    fn default() -> Self {
        ClassificationLoss::SigmoidFocal {
            gamma: default_gamma(),
            alpha: default_alpha(),
        }
    }
}

impl ClassificationLoss {
    /// Sigmoid variants return `[batch, anchors, classes]`, softmax returns
    /// `[batch, anchors, 1]`. Every entry is scaled by the anchor's weight.
    pub fn compute(
        &self,
        logits: ArrayView3<f32>,
        targets: ArrayView3<f32>,
        weights: ArrayView2<f32>,
    ) -> Array3<f32> {
        match self {
            ClassificationLoss::Sigmoid => {
                let mut loss = Array3::zeros(logits.raw_dim());
                Zip::indexed(&mut loss)
                    .and(&logits)
                    .and(&targets)
                    .for_each(|(b, m, _), out, &x, &z| {
                        *out = sigmoid_cross_entropy(x, z) * weights[[b, m]];
                    });
                loss
            }
            ClassificationLoss::SigmoidFocal { gamma, alpha } => {
                let mut loss = Array3::zeros(logits.raw_dim());
                Zip::indexed(&mut loss)
                    .and(&logits)
                    .and(&targets)
                    .for_each(|(b, m, _), out, &x, &z| {
                        let p = sigmoid(x);
                        let p_t = z * p + (1.0 - z) * (1.0 - p);
                        let modulating = (1.0 - p_t).powf(*gamma);
                        let alpha_weight = z * alpha + (1.0 - z) * (1.0 - alpha);
                        *out = modulating
                            * alpha_weight
                            * sigmoid_cross_entropy(x, z)
                            * weights[[b, m]];
                    });
                loss
            }
            ClassificationLoss::Softmax { logit_scale } => {
                let (batch, anchors, _) = logits.dim();
                let mut loss = Array3::zeros((batch, anchors, 1));
                Zip::from(loss.lanes_mut(Axis(2)))
                    .and(logits.lanes(Axis(2)))
                    .and(targets.lanes(Axis(2)))
                    .and(weights)
                    .for_each(|mut out, x, z, &w| {
                        let log_p = log_softmax(x.mapv(|v| v / logit_scale).view());
                        out[0] = -(&log_p * &z).sum() * w;
                    });
                loss
            }
        }
    }
}
