// SPDX-FileCopyrightText: Copyright 2025 Au-Zone Technologies
// SPDX-License-Identifier: Apache-2.0

//! Running training statistics: classification accuracy, precision and
//! recall at fixed score thresholds, and the reduced loss terms.
use std::collections::BTreeMap;

use ndarray::{ArrayView2, ArrayView3, Axis, Zip, s};
use ndarray_stats::QuantileExt;
use serde::{Deserialize, Serialize};

use crate::{
    Error, Result,
    losses::{sigmoid, softmax_inplace},
};

/// How batch values are folded into the running value.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AveragePolicy {
    /// Ratio of the summed totals over the summed counts.
    #[default]
    Simple,
    /// `value = momentum * value + (1 - momentum) * batch_value`
    Exponential { momentum: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloatPrecision {
    /// Accumulators are rounded to `f32` after every update.
    Single,
    #[default]
    Double,
}

impl FloatPrecision {
    fn round(self, x: f64) -> f64 {
        match self {
            FloatPrecision::Single => x as f32 as f64,
            FloatPrecision::Double => x,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct RunningRatio {
    total: f64,
    count: f64,
    ema: Option<f64>,
}

impl RunningRatio {
    fn add(&mut self, total: f64, count: f64, policy: AveragePolicy, precision: FloatPrecision) {
        self.total = precision.round(self.total + total);
        self.count = precision.round(self.count + count);
        if let AveragePolicy::Exponential { momentum } = policy
            && count > 0.0
        {
            let batch = total / count;
            let ema = self
                .ema
                .map_or(batch, |prev| momentum * prev + (1.0 - momentum) * batch);
            self.ema = Some(precision.round(ema));
        }
    }

    fn value(&self, policy: AveragePolicy) -> f64 {
        match policy {
            AveragePolicy::Simple => self.total / self.count.max(1.0),
            AveragePolicy::Exponential { .. } => self.ema.unwrap_or(0.0),
        }
    }

    fn round(&mut self, precision: FloatPrecision) {
        self.total = precision.round(self.total);
        self.count = precision.round(self.count);
        self.ema = self.ema.map(|e| precision.round(e));
    }
}

/// One task's batch of classification outputs and reduced losses.
#[derive(Debug, Clone, Copy)]
pub struct MetricsBatch<'a> {
    /// `[batch, anchors]` integer labels
    pub labels: ArrayView2<'a, i32>,
    /// `[batch, anchors, channels]` classification logits
    pub cls_preds: ArrayView3<'a, f32>,
    /// `[batch, anchors]` anchors that count towards the statistics
    pub cared: ArrayView2<'a, bool>,
    pub encode_background_as_zeros: bool,
    pub use_sigmoid_score: bool,
    pub cls_loss: f32,
    pub loc_loss: f32,
    pub total_loss: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LossMetrics {
    pub cls_loss: f64,
    /// value of the latest batch
    pub cls_loss_rt: f64,
    pub loc_loss: f64,
    pub loc_loss_rt: f64,
    pub total_loss: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub loss: LossMetrics,
    pub rpn_acc: f64,
    /// `prec@NN` and `rec@NN` for every threshold, `NN` in percent
    pub pr: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsAccumulator {
    thresholds: Vec<f32>,
    policy: AveragePolicy,
    precision: FloatPrecision,
    accuracy: RunningRatio,
    prec: Vec<RunningRatio>,
    rec: Vec<RunningRatio>,
    cls_loss: RunningRatio,
    loc_loss: RunningRatio,
    total_loss: RunningRatio,
    last_cls_loss: f64,
    last_loc_loss: f64,
}

impl MetricsAccumulator {
    pub fn new(thresholds: Vec<f32>, policy: AveragePolicy) -> Self {
        let n = thresholds.len();
        Self {
            thresholds,
            policy,
            precision: FloatPrecision::default(),
            accuracy: RunningRatio::default(),
            prec: vec![RunningRatio::default(); n],
            rec: vec![RunningRatio::default(); n],
            cls_loss: RunningRatio::default(),
            loc_loss: RunningRatio::default(),
            total_loss: RunningRatio::default(),
            last_cls_loss: 0.0,
            last_loc_loss: 0.0,
        }
    }

    pub fn thresholds(&self) -> &[f32] {
        &self.thresholds
    }

    pub fn float_precision(&self) -> FloatPrecision {
        self.precision
    }

    /// Switches the accumulator precision, rounding the current state when
    /// narrowing to single precision.
    pub fn set_float_precision(&mut self, precision: FloatPrecision) {
        self.precision = precision;
        for ratio in [
            &mut self.accuracy,
            &mut self.cls_loss,
            &mut self.loc_loss,
            &mut self.total_loss,
        ]
        .into_iter()
        .chain(self.prec.iter_mut())
        .chain(self.rec.iter_mut())
        {
            ratio.round(precision);
        }
    }

    pub fn clear(&mut self) {
        *self = Self {
            precision: self.precision,
            ..Self::new(std::mem::take(&mut self.thresholds), self.policy)
        };
    }

    pub fn update(&mut self, batch: MetricsBatch) -> Result<MetricsSnapshot> {
        let (num_batch, num_anchors) = batch.labels.dim();
        let (b, m, channels) = batch.cls_preds.dim();
        if (b, m) != (num_batch, num_anchors) || batch.cared.dim() != (num_batch, num_anchors) {
            return Err(Error::InvalidShape(format!(
                "labels {:?}, cls_preds {:?} and cared {:?} disagree",
                batch.labels.dim(),
                batch.cls_preds.dim(),
                batch.cared.dim()
            )));
        }
        let foreground = if batch.encode_background_as_zeros {
            channels
        } else {
            channels.saturating_sub(1)
        };
        if foreground == 0 {
            return Err(Error::InvalidShape(format!(
                "cls_preds have {channels} channels and no foreground class"
            )));
        }

        self.update_accuracy(&batch);
        self.update_precision_recall(&batch);

        let (policy, precision) = (self.policy, self.precision);
        for (ratio, value) in [
            (&mut self.cls_loss, batch.cls_loss),
            (&mut self.loc_loss, batch.loc_loss),
            (&mut self.total_loss, batch.total_loss),
        ] {
            if !value.is_nan() {
                ratio.add(value as f64, 1.0, policy, precision);
            }
        }
        self.last_cls_loss = batch.cls_loss as f64;
        self.last_loc_loss = batch.loc_loss as f64;
        Ok(self.snapshot())
    }

    fn update_accuracy(&mut self, batch: &MetricsBatch) {
        let mut matches = 0.0;
        let mut examples = 0.0;
        Zip::from(batch.cls_preds.lanes(Axis(2)))
            .and(batch.labels)
            .and(batch.cared)
            .for_each(|logits, &label, &cared| {
                if !cared {
                    return;
                }
                // NaN logits fall back to background
                let argmax = logits.argmax().unwrap_or(0);
                let predicted = if batch.encode_background_as_zeros {
                    if logits.iter().any(|&x| sigmoid(x) > 0.5) {
                        argmax as i32 + 1
                    } else {
                        0
                    }
                } else {
                    argmax as i32
                };
                examples += 1.0;
                if predicted == label {
                    matches += 1.0;
                }
            });
        self.accuracy
            .add(matches, f64::max(examples, 1.0), self.policy, self.precision);
    }

    fn update_precision_recall(&mut self, batch: &MetricsBatch) {
        let mut scores = batch.cls_preds.to_owned();
        if batch.use_sigmoid_score {
            scores.mapv_inplace(sigmoid);
        } else {
            for lane in scores.lanes_mut(Axis(2)) {
                softmax_inplace(lane);
            }
        }
        let foreground = if batch.encode_background_as_zeros {
            scores.view()
        } else {
            scores.slice(s![.., .., 1..])
        };
        let top = foreground.map_axis(Axis(2), |lane| {
            lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v))
        });

        for (i, &threshold) in self.thresholds.iter().enumerate() {
            let (mut tp, mut fp, mut fn_) = (0.0, 0.0, 0.0);
            Zip::from(&top)
                .and(batch.labels)
                .and(batch.cared)
                .for_each(|&score, &label, &cared| {
                    if !cared {
                        return;
                    }
                    let predicted = score > threshold;
                    match (label > 0, label == 0, predicted) {
                        (true, _, true) => tp += 1.0,
                        (true, _, false) => fn_ += 1.0,
                        (_, true, true) => fp += 1.0,
                        _ => {}
                    }
                });
            if tp + fp > 0.0 {
                self.prec[i].add(tp, tp + fp, self.policy, self.precision);
            }
            if tp + fn_ > 0.0 {
                self.rec[i].add(tp, tp + fn_, self.policy, self.precision);
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut pr = BTreeMap::new();
        for (i, &threshold) in self.thresholds.iter().enumerate() {
            let percent = (threshold as f64 * 100.0).round() as i64;
            pr.insert(format!("prec@{percent}"), self.prec[i].value(self.policy));
            pr.insert(format!("rec@{percent}"), self.rec[i].value(self.policy));
        }
        MetricsSnapshot {
            loss: LossMetrics {
                cls_loss: self.cls_loss.value(self.policy),
                cls_loss_rt: self.last_cls_loss,
                loc_loss: self.loc_loss.value(self.policy),
                loc_loss_rt: self.last_loc_loss,
                total_loss: self.total_loss.value(self.policy),
            },
            rpn_acc: self.accuracy.value(self.policy),
            pr,
        }
    }
}
